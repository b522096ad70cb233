//! Dispatch event fan-out.
//!
//! Handlers run synchronously on the driver task, in frame order. A panicking handler is
//! isolated with `catch_unwind` and dropped once it has panicked `panic_limit` times.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::ProtocolFault;

/// A dispatch event as seen by handlers.
#[derive(Debug, Clone, Copy)]
pub struct GatewayEvent<'a> {
    pub name: &'a str,
    pub sequence: Option<u64>,
    pub data: &'a Value,
}

impl GatewayEvent<'_> {
    /// Deserialize the event payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolFault> {
        T::deserialize(self.data).map_err(|e| ProtocolFault::Json(e.to_string()))
    }
}

pub type Handler = Arc<dyn Fn(&GatewayEvent<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    /// `None` receives every event.
    filter: Option<String>,
    handler: Handler,
    panics: u32,
}

pub struct EventRegistry {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    panic_limit: u32,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("subscribers", &self.len())
            .field("panic_limit", &self.panic_limit)
            .finish()
    }
}

impl EventRegistry {
    pub fn new(panic_limit: u32) -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1), panic_limit }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self, filter: Option<&str>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscriber { id, filter: filter.map(str::to_owned), handler, panics: 0 });
        id
    }

    /// Returns whether `id` was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every matching handler. Returns how many ran to completion.
    pub fn dispatch(&self, event: &GatewayEvent<'_>) -> usize {
        // handlers may subscribe or unsubscribe, so never call them under the lock
        let targets: Vec<(SubscriptionId, Handler)> = self
            .lock()
            .iter()
            .filter(|s| s.filter.as_deref().map_or(true, |name| name == event.name))
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        let mut delivered = 0;
        let mut panicked = Vec::new();
        for (id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => panicked.push(id),
            }
        }
        if !panicked.is_empty() {
            self.record_panics(event.name, &panicked);
        }
        delivered
    }

    fn record_panics(&self, event: &str, ids: &[SubscriptionId]) {
        let limit = self.panic_limit;
        let mut subscribers = self.lock();
        for subscriber in subscribers.iter_mut().filter(|s| ids.contains(&s.id)) {
            subscriber.panics += 1;
            error!(event, subscription = ?subscriber.id, panics = subscriber.panics, "event handler panicked");
        }
        subscribers.retain(|s| {
            let keep = s.panics < limit;
            if !keep {
                warn!(subscription = ?s.id, panics = s.panics, "removing event handler after repeated panics");
            }
            keep
        });
    }
}
