pub mod broker;
pub mod error;
pub mod event_bus;
pub mod id_capture;
pub mod multiplexer;
pub mod protocol;
pub mod pty_engine;
pub mod registry;
pub mod ring;
pub mod task_supervisor;

pub use broker::Broker;
pub use error::CoreError;
pub use event_bus::{BusEvent, EventBus, TaskCompletion, TaskStatus};
pub use id_capture::IdCaptureFilter;
pub use multiplexer::Multiplexer;
pub use protocol::{Inbound, InitFrame, Outbound};
pub use pty_engine::{PtyEngine, SpawnSpec};
pub use registry::{ExecutionMode, SessionKind, SessionRecord, SessionRegistry, SessionState};
pub use ring::RingBuffer;
pub use task_supervisor::{CompletionMarker, TaskHandle, TaskSpec, TaskSupervisor};
