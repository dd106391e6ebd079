//! In-process publish/subscribe and request/reply.
//!
//! Dispatch is topic-keyed and per-topic FIFO with respect to a single
//! emitter: `emit` invokes the topic's handlers in registration order and
//! resolves once every handler has settled. A panic-free failing handler
//! never prevents the rest from running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::DelegateError;

use super::{Event, Topic};

/// Subscription limits and request defaults.
#[derive(Debug, Clone)]
pub struct BusLimits {
    /// Maximum handlers registered on any single topic.
    pub max_listeners_per_event: usize,
    /// Maximum handlers across all topics.
    pub max_total_subscriptions: usize,
    /// Default timeout for [`EventBus::request`].
    pub request_timeout: Duration,
}

impl Default for BusLimits {
    fn default() -> Self {
        Self {
            max_listeners_per_event: 100,
            max_total_subscriptions: 1000,
            request_timeout: Duration::from_secs(5),
        }
    }
}

type HandlerFn = Arc<dyn Fn(Event, Replier) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Registration {
    id: u64,
    name: String,
    handler: HandlerFn,
}

#[derive(Default)]
struct BusState {
    handlers: HashMap<Topic, Vec<Registration>>,
    next_id: u64,
    total: usize,
}

struct PendingRequest {
    reply: oneshot::Sender<Result<serde_json::Value, DelegateError>>,
    deadline: Instant,
}

type PendingMap = Mutex<HashMap<Uuid, PendingRequest>>;

struct BusInner {
    limits: BusLimits,
    state: Mutex<BusState>,
    pending: Arc<PendingMap>,
}

/// Handle returned by [`EventBus::subscribe`]; pass to
/// [`EventBus::unsubscribe`] to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
}

/// Reply channel handed to handlers.
///
/// Carries the correlation ID when the dispatch came from
/// [`EventBus::request`]; for plain `emit` dispatches both respond calls
/// are no-ops.
#[derive(Clone)]
pub struct Replier {
    correlation_id: Option<Uuid>,
    pending: Weak<PendingMap>,
}

impl Replier {
    /// Satisfy the originating request with a value.
    ///
    /// Only the first response for a correlation ID wins; responses for
    /// unknown (already-satisfied or timed-out) IDs are silently dropped.
    pub fn respond(&self, value: serde_json::Value) {
        self.send(Ok(value));
    }

    /// Fail the originating request.
    pub fn respond_error(&self, err: DelegateError) {
        self.send(Err(err));
    }

    /// Whether a response is expected at all.
    pub fn expects_response(&self) -> bool {
        self.correlation_id.is_some()
    }

    fn send(&self, result: Result<serde_json::Value, DelegateError>) {
        let Some(id) = self.correlation_id else {
            return;
        };
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        let entry = pending.lock().expect("pending map poisoned").remove(&id);
        match entry {
            Some(request) => {
                // The requester may have given up; a closed channel is fine.
                let _ = request.reply.send(result);
            }
            None => {
                debug!(correlation_id = %id, "dropping response for unknown request");
            }
        }
    }
}

/// The event bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(limits: BusLimits) -> Self {
        Self {
            inner: Arc::new(BusInner {
                limits,
                state: Mutex::new(BusState::default()),
                pending: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Register a handler for one topic.
    ///
    /// `name` identifies the handler in logs when it fails. Returns
    /// `RESOURCE_EXHAUSTED` when either subscription bound would be
    /// exceeded.
    pub fn subscribe<F>(
        &self,
        topic: Topic,
        name: impl Into<String>,
        handler: F,
    ) -> Result<SubscriptionHandle, DelegateError>
    where
        F: Fn(Event, Replier) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock().expect("bus state poisoned");

        let per_topic = state.handlers.get(&topic).map_or(0, |v| v.len());
        if per_topic + 1 > self.inner.limits.max_listeners_per_event {
            return Err(DelegateError::ResourceExhausted(format!(
                "topic {topic} already has {per_topic} handlers (max {})",
                self.inner.limits.max_listeners_per_event
            )));
        }
        if state.total + 1 > self.inner.limits.max_total_subscriptions {
            return Err(DelegateError::ResourceExhausted(format!(
                "bus already has {} subscriptions (max {})",
                state.total, self.inner.limits.max_total_subscriptions
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        state.handlers.entry(topic).or_default().push(Registration {
            id,
            name: name.into(),
            handler: Arc::new(handler),
        });
        state.total += 1;

        Ok(SubscriptionHandle { topic, id })
    }

    /// Deregister a handler. Idempotent.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut guard = self.inner.state.lock().expect("bus state poisoned");
        let state = &mut *guard;
        if let Some(regs) = state.handlers.get_mut(&handle.topic) {
            let before = regs.len();
            regs.retain(|r| r.id != handle.id);
            state.total -= before - regs.len();
            if regs.is_empty() {
                state.handlers.remove(&handle.topic);
            }
        }
    }

    /// Fan an event out to every handler on its topic.
    ///
    /// Handlers run in registration order; a handler error is logged with
    /// the topic and handler name and does not stop the remaining
    /// handlers. Resolves when all handlers have settled.
    pub async fn emit(&self, event: Event) {
        self.dispatch(event, None).await;
    }

    /// Correlation-ID request/reply.
    ///
    /// Fails immediately when no handlers are registered for the topic.
    /// The first handler to call [`Replier::respond`] (or
    /// [`Replier::respond_error`]) satisfies the request; a distinct
    /// `TIMEOUT` error is returned after `timeout` (defaulting to the bus
    /// limit). The pending entry is released on success, error, and
    /// timeout alike.
    pub async fn request(
        &self,
        event: Event,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, DelegateError> {
        let topic = event.topic();
        let timeout = timeout.unwrap_or(self.inner.limits.request_timeout);

        {
            let state = self.inner.state.lock().expect("bus state poisoned");
            if state.handlers.get(&topic).map_or(true, |v| v.is_empty()) {
                return Err(DelegateError::InvalidOperation(format!(
                    "no handlers registered for topic {topic}"
                )));
            }
        }

        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(
                correlation_id,
                PendingRequest {
                    reply: tx,
                    deadline: Instant::now() + timeout,
                },
            );

        self.dispatch(event, Some(correlation_id)).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => {
                // Sender dropped without responding (e.g. swept).
                self.remove_pending(correlation_id);
                Err(DelegateError::System(anyhow::anyhow!(
                    "request channel closed without a response"
                )))
            }
            Err(_elapsed) => {
                self.remove_pending(correlation_id);
                Err(DelegateError::Timeout(timeout))
            }
        }
    }

    /// Number of requests still awaiting a response. Drops back to zero
    /// after any sequence of request/respond/timeout.
    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.lock().expect("pending map poisoned").len()
    }

    /// Number of live subscriptions across all topics.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().expect("bus state poisoned").total
    }

    /// Drop pending entries whose deadline has passed.
    ///
    /// The timeout path in [`request`](Self::request) already releases its
    /// own entry; the sweep only catches requesters that were cancelled
    /// mid-await and never reached that path.
    pub fn sweep_expired_requests(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.inner.pending.lock().expect("pending map poisoned");
        let before = pending.len();
        pending.retain(|_, req| req.deadline > now);
        let swept = before - pending.len();
        if swept > 0 {
            warn!(swept, "swept expired pending requests");
        }
        swept
    }

    /// Periodic sweep loop, stopped by the cancellation token.
    pub async fn run_cleanup(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired_requests();
                }
            }
        }
    }

    fn remove_pending(&self, id: Uuid) {
        self.inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&id);
    }

    async fn dispatch(&self, event: Event, correlation_id: Option<Uuid>) {
        let topic = event.topic();
        let handlers: Vec<(String, HandlerFn)> = {
            let state = self.inner.state.lock().expect("bus state poisoned");
            state
                .handlers
                .get(&topic)
                .map(|regs| {
                    regs.iter()
                        .map(|r| (r.name.clone(), Arc::clone(&r.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (name, handler) in handlers {
            let replier = Replier {
                correlation_id,
                pending: Arc::downgrade(&self.inner.pending),
            };
            if let Err(e) = handler(event.clone(), replier).await {
                error!(
                    topic = %topic,
                    handler = %name,
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }
}
