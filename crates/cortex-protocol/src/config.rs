//! Kernel configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ProtocolError, ProtocolResult};

/// Tunables for one kernel instance. Every field has a serde default, so a
/// partial JSON document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Initial energy, clamped into `[0, 1]` when the kernel is built.
    pub energy: f64,
    pub dormancy_threshold: f64,
    pub health_check_interval_ms: u64,
    /// Wall-clock budget of one task from sensing to reflecting.
    pub max_task_timeout_ms: u64,
    /// Budget of a single agent request.
    pub request_timeout_ms: u64,
    pub enable_self_improvement: bool,
    pub task_history_capacity: usize,
    pub violation_log_capacity: usize,
    pub min_responsive_agents: usize,
    /// Energy spent per finished task.
    pub task_energy_cost: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            energy: 1.0,
            dormancy_threshold: 0.1,
            health_check_interval_ms: 30_000,
            max_task_timeout_ms: 300_000,
            request_timeout_ms: 30_000,
            enable_self_improvement: false,
            task_history_capacity: 1_000,
            violation_log_capacity: 256,
            min_responsive_agents: 1,
            task_energy_cost: 0.0,
        }
    }
}

impl KernelConfig {
    pub fn from_json(raw: &str) -> ProtocolResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|error| ProtocolError::InvalidConfig(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn max_task_timeout(&self) -> Duration {
        Duration::from_millis(self.max_task_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if !(0.0..=1.0).contains(&self.dormancy_threshold) {
            return Err(ProtocolError::InvalidConfig(format!(
                "dormancy_threshold must be within [0, 1], got {}",
                self.dormancy_threshold
            )));
        }
        if !self.task_energy_cost.is_finite() || self.task_energy_cost < 0.0 {
            return Err(ProtocolError::InvalidConfig(format!(
                "task_energy_cost must be a non-negative number, got {}",
                self.task_energy_cost
            )));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ProtocolError::InvalidConfig(
                "health_check_interval_ms must be positive".to_owned(),
            ));
        }
        if self.request_timeout_ms == 0 || self.max_task_timeout_ms == 0 {
            return Err(ProtocolError::InvalidConfig(
                "timeouts must be positive".to_owned(),
            ));
        }
        if self.task_history_capacity == 0 {
            return Err(ProtocolError::InvalidConfig(
                "task_history_capacity must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Clamp an energy reading into `[0, 1]`. NaN reads as empty.
pub fn clamp_energy(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = KernelConfig::from_json(r#"{"dormancy_threshold": 0.2}"#).unwrap();
        assert_eq!(config.dormancy_threshold, 0.2);
        assert_eq!(config.energy, 1.0);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let err = KernelConfig::from_json(r#"{"dormancy_threshold": 1.5}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidConfig(_)));
    }

    #[test]
    fn clamp_handles_nan_and_bounds() {
        assert_eq!(clamp_energy(f64::NAN), 0.0);
        assert_eq!(clamp_energy(-3.0), 0.0);
        assert_eq!(clamp_energy(7.0), 1.0);
        assert_eq!(clamp_energy(0.42), 0.42);
        assert_eq!(clamp_energy(f64::INFINITY), 1.0);
    }
}
