//! # Service Wiring
//!
//! Combines one [`TaskEngine`] and one [`EventManager`] into a service with a
//! shared lifecycle, and provides the bridge that turns inbound messages into
//! engine tasks.
//!
//! ```text
//! producer ──► EventManager ──► route factory ──► TaskEngine ──► worker ──► callbacks
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use taskhub::{MessagePayload, ServiceConfig, Task, TaskBody, TaskInput, TaskService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = TaskService::new(ServiceConfig::default())?;
//!
//!     service.route("greet", |event| {
//!         let name = event.payload.get("name").cloned().unwrap_or_default();
//!         let task = Task::new("greet", TaskBody::from_fn(|input| async move {
//!             Ok(serde_json::json!({ "greeting": format!("hello {}", input.data["name"]) }))
//!         }));
//!         Ok(vec![(task, TaskInput::new().with_field("name", name))])
//!     });
//!
//!     service.start().await;
//!     service
//!         .events()
//!         .submit_message(MessagePayload::new("greet"), "client-1")?;
//!
//!     service.events().wait_idle().await;
//!     service.engine().wait_idle().await;
//!     println!("{:?}", service.status());
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

use crate::events::{EventManager, EventManagerConfig, EventStats, MessageEvent, handler_fn};
use crate::task::{EngineStats, Task, TaskEngine, TaskEngineConfig, TaskInput};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// One task engine and one event manager with a shared lifecycle
pub struct TaskService {
    engine: Arc<TaskEngine>,
    events: Arc<EventManager>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub engine: TaskEngineConfig,
    pub events: EventManagerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub engine: EngineStats,
    pub events: EventStats,
    pub is_healthy: bool,
}

impl TaskService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            engine: Arc::new(TaskEngine::new(config.engine)),
            events: Arc::new(EventManager::new(config.events)),
        })
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// Start the engine, then the event manager
    pub async fn start(&self) {
        self.engine.start().await;
        self.events.start().await;
        info!("Task service started");
    }

    /// Stop the event manager first so no new tasks arrive, then the engine
    pub async fn stop(&self) {
        self.events.stop().await;
        self.engine.stop().await;
        info!("Task service stopped");
    }

    /// Register a handler for `message_type` that submits every task the
    /// factory builds from the message. The message counts as failed if the
    /// factory errors or any submission is rejected.
    pub fn route<F>(&self, message_type: &str, factory: F)
    where
        F: Fn(&MessageEvent) -> Result<Vec<(Task, TaskInput)>> + Send + Sync + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let factory = Arc::new(factory);

        self.events.register_message_handler(
            message_type,
            handler_fn(move |event: MessageEvent| {
                let engine = Arc::clone(&engine);
                let factory = Arc::clone(&factory);
                async move {
                    let tasks = (*factory)(&event)
                        .with_context(|| format!("Failed to build tasks for message {}", event.id))?;

                    let mut rejected = 0;
                    for (task, input) in tasks {
                        let name = task.name.clone();
                        if let Err(e) = engine.submit_task(task, input) {
                            warn!("Message {} could not submit task '{}': {}", event.id, name, e);
                            rejected += 1;
                        }
                    }

                    if rejected > 0 {
                        anyhow::bail!("{} task(s) from message {} were rejected", rejected, event.id);
                    }
                    Ok(())
                }
            }),
        );
    }

    pub fn status(&self) -> ServiceStatus {
        let engine = self.engine.get_stats();
        let events = self.events.get_stats();
        let is_healthy = engine.is_running && events.is_running;

        ServiceStatus {
            engine,
            events,
            is_healthy,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.events.validate()?;
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).context("Failed to write config file")
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}
