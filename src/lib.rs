//! # taskhub
//!
//! An in-process priority task engine paired with a typed message queue.
//! Producers submit tasks directly, or post messages that registered
//! handlers turn into tasks.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: Priority queue, fixed-size worker pool and the engine that
//!   dispatches between them
//! - **[`events`]**: Bounded message queue dispatching by type tag to handlers
//! - **[`integration`]**: One engine plus one event manager with a shared
//!   lifecycle and message-to-task routing
//!
//! ## Features
//!
//! ### Task Engine
//! - **Priority Ordering**: Critical before High before Normal before Low, FIFO within a level
//! - **Backpressure**: Bounded queue; submission fails immediately when full
//! - **Isolation**: Errors and panics in task bodies are recorded, never propagated
//! - **Cancellation**: Guaranteed for queued tasks, best effort for running ones
//!
//! ### Event Manager
//! - **Type Dispatch**: One handler per message type, last registration wins
//! - **Accounting**: Unroutable, failing and panicking messages are all counted
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskhub::{Task, TaskBody, TaskEngine, TaskEngineConfig, TaskInput, TaskPriority};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = TaskEngine::new(TaskEngineConfig::default());
//!     engine.start().await;
//!
//!     let task = Task::new(
//!         "double",
//!         TaskBody::from_fn(|input| async move {
//!             let n = input.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
//!             Ok(serde_json::json!(n * 2))
//!         }),
//!     )
//!     .with_priority(TaskPriority::High);
//!
//!     let id = engine.submit_task(task, TaskInput::new().with_field("n", 21.into()))?;
//!     let done = engine.wait_for_task(id).await?;
//!     println!("{:?}", done.output);
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

/// Priority task scheduling and execution.
///
/// Provides the task model, the bounded priority queue, the worker pool and
/// the engine that ties them together.
pub mod task;

/// Typed message queue with per-type handler dispatch.
pub mod events;

/// Service wiring of the task engine and event manager.
pub mod integration;

/// Environment constants, defaults and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

// Re-export main task types
pub use task::{
    EngineCallbacks, EngineError, EngineStats, Task, TaskBody, TaskEngine, TaskEngineConfig,
    TaskId, TaskInput, TaskOutput, TaskPriority, TaskStatus, TaskWork,
};

// Re-export event types
pub use events::{
    EventError, EventManager, EventManagerConfig, EventStats, MessageEvent, MessageHandler,
    MessagePayload, handler_fn,
};

// Re-export integration types
pub use integration::{ServiceConfig, ServiceStatus, TaskService};
