//! Typed identifiers.
//!
//! Every id is an opaque, serde-transparent `String` wrapper. Generated ids are
//! UUID v4; agents get readable ids (`builder-1`) assigned by the registry.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::generate()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of a single bus message.
    MessageId
);
typed_id!(
    /// Token linking a request message to its reply.
    CorrelationId
);
typed_id!(
    /// Identifier of a submitted task.
    TaskId
);
typed_id!(
    /// Identifier of a task plan.
    PlanId
);
typed_id!(
    /// Identifier of a step, unique within its plan.
    StepId
);
typed_id!(
    /// Identifier of a registered agent; doubles as its bus endpoint name.
    AgentId
);
