use kube::Resource;
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use nodeforge_types::MachinePool;
use owo_colors::OwoColorize;

use super::MANAGER_NAME;

pub const POOL_OVERLAP: &str = "PoolOverlap";
pub const POOL_OVERLAP_RESOLVED: &str = "PoolOverlapResolved";
pub const NODE_CORDON: &str = "NodeCordon";
pub const NODE_DRAIN: &str = "NodeDrain";
pub const DRAIN_FAILED: &str = "DrainFailed";
pub const DRAIN_STUCK: &str = "DrainStuck";
pub const DRAIN_COMPLETE: &str = "DrainComplete";
pub const NODE_UNCORDON: &str = "NodeUncordon";
pub const ROLLOUT_BATCH: &str = "RolloutBatch";
pub const ROLLOUT_COMPLETE: &str = "RolloutComplete";
pub const APPLY_TIMEOUT: &str = "ApplyTimeout";
pub const DRAIN_CONFIG_INVALID: &str = "DrainConfigInvalid";

/// Publishes pool-scoped events. Publish failures are logged and swallowed;
/// an event is never worth failing a reconcile over.
pub struct EventSink {
    recorder: Recorder,
}

impl EventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: MANAGER_NAME.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn normal(&self, pool: &MachinePool, reason: &str, note: String) {
        self.publish(pool, EventType::Normal, reason, note).await;
    }

    pub async fn warning(&self, pool: &MachinePool, reason: &str, note: String) {
        self.publish(pool, EventType::Warning, reason, note).await;
    }

    async fn publish(&self, pool: &MachinePool, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &pool.object_ref(&())).await {
            eprintln!(
                "{}",
                format!("failed to publish {} event: {}", reason, e).yellow()
            );
        }
    }
}
