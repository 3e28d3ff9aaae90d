//! System event bus.
//!
//! Small in-process fan-out used to tell the wider application about task
//! completions and agent deployment. The topic set is closed: events are
//! tagged variants, not free-form maps. Delivery is best-effort and in
//! publish order; a publisher never blocks on its subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

/// How many events a slow subscriber may fall behind before it starts
/// observing `Lagged`.
const BUS_CAPACITY: usize = 256;

/// Final status of a task, as published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Payload of a `task_completed` event.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCompletion {
    pub task_id: String,
    /// The Agent's own session id: captured from output, or read from the
    /// completion marker (marker authoritative when both exist).
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    pub status: TaskStatus,
    /// Opaque to the core; forwarded verbatim to downstream consumers.
    pub notification_targets: serde_json::Value,
    pub ended_at: String,
}

/// Events carried by the bus. The `topic` tag is the wire-visible name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum BusEvent {
    TaskCompleted(TaskCompletion),
    AgentsDeployed { task_id: String },
}

/// Clonable handle to the process-wide bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event to all current subscribers. Returns the number of
    /// subscribers that received it; zero is not an error.
    pub fn publish(&self, event: BusEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                log::debug!("Bus event with no subscribers: {event:?}");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
