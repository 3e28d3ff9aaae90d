//! Explicit dependency root.
//!
//! Everything that used to be a process-wide singleton in earlier designs
//! hangs off one `Broker`: configuration, the session registry, the event
//! bus, and the task supervisor. The server keeps it in shared state and
//! every subsystem is constructed around it.

use std::sync::Arc;

use crate::config::Config;
use crate::core::event_bus::EventBus;
use crate::core::registry::SessionRegistry;
use crate::core::task_supervisor::{TaskHandle, TaskSpec, TaskSupervisor};

pub struct Broker {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    tasks: TaskSupervisor,
}

impl Broker {
    pub fn new(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let bus = EventBus::new();
        let tasks = TaskSupervisor::new(config.clone(), registry.clone(), bus.clone());
        Arc::new(Self {
            config,
            registry,
            bus,
            tasks,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tasks(&self) -> &TaskSupervisor {
        &self.tasks
    }

    /// Programmatic task submission for callers that never open a channel
    /// (background runs driven by the wider application).
    pub fn submit_task(
        &self,
        spec: TaskSpec,
    ) -> Result<Arc<TaskHandle>, crate::core::error::CoreError> {
        self.tasks.launch(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_wires_the_parts_together() {
        let broker = Broker::new(Config::default());
        assert_eq!(broker.registry().active_count(), 0);
        assert_eq!(broker.config().default_cols, 120);
        let mut rx = broker.bus().subscribe();
        broker.bus().publish(crate::core::event_bus::BusEvent::AgentsDeployed {
            task_id: "T0".to_string(),
        });
        assert!(rx.try_recv().is_ok());
    }
}
