//! In-process message bus.
//!
//! Endpoints subscribe to a topic (exactly or by prefix) and receive
//! [`Message`]s through an unbounded mailbox. `request` layers a correlated
//! request/response exchange with a timeout on top of point-to-point delivery:
//! replies never reach subscriber mailboxes, they resolve the waiting request
//! directly, and at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cortex_protocol::{
    Address, BusError, CorrelationId, Message, MessageId, MessageKind, Response,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, trace, warn};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;
const FIREHOSE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicFilter {
    Exact(String),
    Prefix(String),
}

impl TopicFilter {
    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Exact(expected) => expected == topic,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

struct SubscriptionEntry {
    id: u64,
    filter: TopicFilter,
    sender: mpsc::UnboundedSender<Message>,
}

struct PendingRequest {
    request_id: MessageId,
    reply: oneshot::Sender<Response>,
}

struct BusInner {
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    history: Mutex<VecDeque<Message>>,
    history_capacity: usize,
    firehose: broadcast::Sender<Message>,
    next_subscription: AtomicU64,
}

impl BusInner {
    fn unsubscribe(&self, id: u64) {
        self.subscriptions.lock().retain(|entry| entry.id != id);
    }
}

/// Mailbox returned by `subscribe`. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(FIREHOSE_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity.min(4096))),
                history_capacity,
                firehose,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to messages addressed exactly to `address`.
    pub fn subscribe(&self, address: &Address) -> Subscription {
        self.add_subscription(TopicFilter::Exact(address.topic()))
    }

    pub fn subscribe_topic(&self, topic: impl Into<String>) -> Subscription {
        self.add_subscription(TopicFilter::Exact(topic.into()))
    }

    /// Subscribe to every topic starting with `prefix`.
    pub fn subscribe_prefix(&self, prefix: impl Into<String>) -> Subscription {
        self.add_subscription(TopicFilter::Prefix(prefix.into()))
    }

    fn add_subscription(&self, filter: TopicFilter) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let topic = match &filter {
            TopicFilter::Exact(topic) | TopicFilter::Prefix(topic) => topic.clone(),
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.subscriptions.lock().push(SubscriptionEntry {
            id,
            filter,
            sender,
        });
        debug!(subscription = id, %topic, "subscription added");
        Subscription {
            id,
            topic,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions that would receive a message on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .filter(|entry| !entry.sender.is_closed() && entry.filter.matches(topic))
            .count()
    }

    /// Live subscriptions on exactly `topic`. Prefix observers are not
    /// endpoints and never answer requests.
    pub fn endpoint_count(&self, topic: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .filter(|entry| {
                !entry.sender.is_closed()
                    && matches!(&entry.filter, TopicFilter::Exact(exact) if exact == topic)
            })
            .count()
    }

    /// Fire-and-forget delivery to every subscription matching `topic`.
    pub fn publish(&self, topic: &str, message: Message) -> usize {
        self.record(&message);
        self.deliver(topic, message)
    }

    /// Point-to-point send. Returns how many subscribers the message reached.
    pub fn send(&self, from: Address, to: Address, kind: MessageKind) -> usize {
        self.dispatch(Message::new(from, to, kind))
    }

    /// Deliver a prepared message to its `to` address.
    pub fn dispatch(&self, message: Message) -> usize {
        if message.to == Address::Broadcast {
            self.record(&message);
            return self.deliver_all(message);
        }
        if let MessageKind::Response(_) = &message.kind
            && message.correlation_id.is_some()
        {
            self.record(&message);
            return usize::from(self.resolve(message));
        }
        let topic = message.to.topic();
        self.publish(&topic, message)
    }

    /// Delivered once to every live subscription.
    pub fn broadcast(&self, from: Address, kind: MessageKind) -> usize {
        self.dispatch(Message::new(from, Address::Broadcast, kind))
    }

    /// Send `kind` to `to` and wait up to `timeout` for the correlated reply.
    #[instrument(
        skip_all,
        fields(kind = kind.name(), %from, %to, timeout_ms = timeout.as_millis() as u64)
    )]
    pub async fn request(
        &self,
        from: Address,
        to: Address,
        kind: MessageKind,
        timeout: Duration,
    ) -> Result<Response, BusError> {
        let topic = to.topic();
        if self.endpoint_count(&topic) == 0 {
            debug!("no endpoint subscribed");
            return Err(BusError::Unavailable(format!(
                "no endpoint subscribed to {topic}"
            )));
        }

        let correlation_id = CorrelationId::generate();
        let message = Message::new(from, to, kind).with_correlation(correlation_id.clone());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                request_id: message.id.clone(),
                reply: reply_tx,
            },
        );

        if self.publish(&topic, message) == 0 {
            self.inner.pending.lock().remove(&correlation_id);
            return Err(BusError::Unavailable(format!(
                "no endpoint subscribed to {topic}"
            )));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BusError::Unavailable(format!(
                "reply channel for {topic} closed"
            ))),
            Err(_) => {
                self.inner.pending.lock().remove(&correlation_id);
                debug!(%correlation_id, "request timed out");
                Err(BusError::Timeout {
                    correlation_id,
                    timeout,
                })
            }
        }
    }

    /// Answer `request`. Returns `false` when nobody is waiting any more
    /// (timed out, already answered, or never a request).
    pub fn reply(&self, request: &Message, from: Address, response: Response) -> bool {
        if request.correlation_id.is_none() {
            warn!(message_id = %request.id, "reply to a message without correlation id");
            return false;
        }
        self.dispatch(request.reply(from, response)) > 0
    }

    fn resolve(&self, reply: Message) -> bool {
        let Some(correlation_id) = reply.correlation_id.clone() else {
            return false;
        };
        let pending = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&correlation_id) {
                Some(entry) if reply.reply_to.as_ref() == Some(&entry.request_id) => {
                    pending.remove(&correlation_id)
                }
                _ => None,
            }
        };
        let Some(pending) = pending else {
            debug!(%correlation_id, "late or duplicate reply dropped");
            return false;
        };
        let MessageKind::Response(response) = reply.kind else {
            return false;
        };
        pending.reply.send(response).is_ok()
    }

    fn deliver(&self, topic: &str, message: Message) -> usize {
        let mut delivered = 0;
        self.inner.subscriptions.lock().retain(|entry| {
            if !entry.filter.matches(topic) {
                return !entry.sender.is_closed();
            }
            match entry.sender.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        trace!(topic, delivered, kind = message.kind.name(), "message delivered");
        delivered
    }

    fn deliver_all(&self, message: Message) -> usize {
        let mut delivered = 0;
        self.inner.subscriptions.lock().retain(|entry| {
            match entry.sender.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        trace!(delivered, kind = message.kind.name(), "message broadcast");
        delivered
    }

    fn record(&self, message: &Message) {
        if self.inner.history_capacity > 0 {
            let mut history = self.inner.history.lock();
            if history.len() == self.inner.history_capacity {
                history.pop_front();
            }
            history.push_back(message.clone());
        }
        let _ = self.inner.firehose.send(message.clone());
    }

    /// The most recent `limit` messages, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Message> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Every message that passes through the bus, for observers.
    pub fn stream(&self) -> BroadcastStream<Message> {
        BroadcastStream::new(self.inner.firehose.subscribe())
    }

    pub fn watch(&self) -> broadcast::Receiver<Message> {
        self.inner.firehose.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
