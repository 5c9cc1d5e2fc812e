use fleet_common::bus::LifecycleEventKind;
use fleet_common::{Actor, LifecycleOperation};
use tokio::time::Instant;

use crate::error::Outcome;
use crate::events::EventBus;

/// Start/complete record for one lifecycle operation.
///
/// Completion logs the duration and publishes an `OperationFinished` event, so
/// subscribers see exactly one terminal event per operation.
pub struct ActionLog {
    operation: LifecycleOperation,
    resource_id: String,
    user: String,
    started: Instant,
    events: EventBus,
}

impl ActionLog {
    pub fn start(
        events: &EventBus,
        operation: LifecycleOperation,
        resource_id: &str,
        actor: &Actor,
    ) -> Self {
        tracing::info!(
            "📝 [action] {} {} by {} - in_progress",
            operation,
            resource_id,
            actor.user_name
        );
        Self {
            operation,
            resource_id: resource_id.to_string(),
            user: actor.user_name.clone(),
            started: Instant::now(),
            events: events.clone(),
        }
    }

    /// Create only learns the instance id once the provider answers.
    pub fn set_resource(&mut self, resource_id: &str) {
        self.resource_id = resource_id.to_string();
    }

    pub fn complete<T>(self, outcome: &Outcome<T>) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let kind = outcome.kind();
        let detail = outcome.detail();
        match outcome {
            Outcome::Succeeded(_) => tracing::info!(
                "✅ [action] {} {} by {} - {} ({} ms)",
                self.operation,
                self.resource_id,
                self.user,
                kind.as_str(),
                duration_ms
            ),
            _ => tracing::warn!(
                "⚠️ [action] {} {} by {} - {} ({} ms): {}",
                self.operation,
                self.resource_id,
                self.user,
                kind.as_str(),
                duration_ms,
                detail.as_deref().unwrap_or("-")
            ),
        }
        self.events.publish(
            &self.resource_id,
            LifecycleEventKind::OperationFinished {
                operation: self.operation,
                outcome: kind,
                duration_ms,
                detail,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;
    use fleet_common::bus::OutcomeKind;
    use std::time::Duration;

    fn actor() -> Actor {
        Actor {
            user_id: "u-1".into(),
            user_name: "carol".into(),
            is_admin: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completion_publishes_duration_and_detail() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let mut log = ActionLog::start(&bus, LifecycleOperation::Create, "pending", &actor());
        log.set_resource("inst-7");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        log.complete(&Outcome::<()>::Rejected(Rejection::SnapshotFailed));

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.resource_id, "inst-7");
        assert_eq!(
            evt.kind,
            LifecycleEventKind::OperationFinished {
                operation: LifecycleOperation::Create,
                outcome: OutcomeKind::Rejected,
                duration_ms: 1500,
                detail: Some("snapshot failed".into()),
            }
        );
    }
}
