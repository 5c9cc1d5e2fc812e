use fleet_common::bus::{LifecycleEvent, LifecycleEventKind};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of lifecycle events to any number of subscribers.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe a lag instead of slowing pollers down.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, resource_id: &str, kind: LifecycleEventKind) {
        let evt = LifecycleEvent::new(resource_id, kind);
        tracing::trace!(resource_id, event = evt.kind.as_str(), "event published");
        let _ = self.tx.send(evt);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
