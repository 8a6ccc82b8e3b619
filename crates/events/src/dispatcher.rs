//! The emission seam used by the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::bus::EventBus;
use crate::event::JobEvent;

/// Receives job notifications from the scheduler.
///
/// Callers check [`EventDispatcher::is_enabled`] before building an event so a
/// disabled dispatcher costs nothing.
pub trait EventDispatcher: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn dispatch(&self, event: JobEvent);
}

/// Dispatcher that drops everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopEventDispatcher;

impl EventDispatcher for NoopEventDispatcher {
    fn is_enabled(&self) -> bool {
        false
    }

    fn dispatch(&self, _event: JobEvent) {}
}

/// Dispatcher that publishes onto an [`EventBus`] and can be switched off at
/// runtime.
#[derive(Debug)]
pub struct BusEventDispatcher<B> {
    bus: B,
    enabled: AtomicBool,
}

impl<B> BusEventDispatcher<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> EventDispatcher for BusEventDispatcher<B>
where
    B: EventBus<JobEvent>,
{
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn dispatch(&self, event: JobEvent) {
        if !self.is_enabled() {
            return;
        }
        let kind = event.kind;
        let job_id = event.job_id;
        // Notifications never fail the unit of work that produced them.
        if let Err(err) = self.bus.publish(event) {
            warn!(job_id = %job_id, event_type = kind.event_type(), error = ?err, "failed to publish job event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::JobEventKind;
    use crate::in_memory_bus::InMemoryEventBus;
    use chrono::Utc;
    use jobforge_core::JobId;
    use std::sync::Arc;

    fn deleted_event() -> JobEvent {
        JobEvent::new(JobEventKind::EntityDeleted, JobId::new(), "async-continuation", Utc::now())
    }

    #[test]
    fn publishes_while_enabled() {
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let dispatcher = BusEventDispatcher::new(bus.clone());

        dispatcher.dispatch(deleted_event());

        let received = sub.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, JobEventKind::EntityDeleted);
    }

    #[test]
    fn disabled_dispatcher_is_silent() {
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let dispatcher = BusEventDispatcher::new(bus.clone());
        dispatcher.set_enabled(false);

        dispatcher.dispatch(deleted_event());

        assert!(sub.drain().is_empty());
        assert!(!NoopEventDispatcher.is_enabled());
    }
}
