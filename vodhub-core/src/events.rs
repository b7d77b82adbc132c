//! Typed event dispatcher
//!
//! Subscribers are registered at construction time; there is no runtime
//! reflection. Dispatch is synchronous and best-effort: a subscriber that
//! panics is isolated by the caller's task, not by the bus.

use std::sync::Arc;

/// Events emitted by the engine that external collaborators may observe.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A `push://` play target was received; listeners (e.g. a cast
    /// receiver) should pick it up.
    PushTarget { url: String },
    /// A new config epoch was installed.
    EpochChanged { epoch: u64 },
    /// A search was performed (query recorded for history sinks).
    SearchPerformed { query: String },
}

/// Event subscriber callback.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EventSubscriber for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event);
    }
}

/// Dispatches events to subscribers in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Vec<Box<dyn EventSubscriber>>>,
}

impl EventBus {
    pub fn new(subscribers: Vec<Box<dyn EventSubscriber>>) -> Self {
        Self {
            subscribers: Arc::new(subscribers),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        tracing::debug!(?event, "event published");
        for sub in self.subscribers.iter() {
            sub.on_event(&event);
        }
    }
}
