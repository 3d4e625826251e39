use crate::env;
use crate::events::types::*;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded message queue with type-tag dispatch to registered handlers
pub struct EventManager {
    shared: Arc<EventShared>,
    consumer: Mutex<ConsumerSlot>,
}

/// Configuration for the event manager
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventManagerConfig {
    /// Maximum number of undelivered messages
    pub queue_capacity: usize,
    /// Handlers running longer than this are abandoned and counted as failed
    pub handler_timeout_secs: Option<u64>,
}

/// Snapshot of event manager counters
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventStats {
    pub total_messages: u64,
    pub processed_messages: u64,
    /// Handler errors, panics, timeouts and unroutable messages
    pub failed_messages: u64,
    /// Messages with no registered handler (also counted in `failed_messages`)
    pub dropped_messages: u64,
    pub queue_size: usize,
    /// Handlers executing right now
    pub running_count: usize,
    pub registered_handlers: usize,
    pub is_running: bool,
}

struct ConsumerSlot {
    receiver: Option<mpsc::Receiver<MessageEvent>>,
    running: Option<ConsumerHandle>,
}

struct ConsumerHandle {
    shutdown: CancellationToken,
    task: JoinHandle<mpsc::Receiver<MessageEvent>>,
}

#[derive(Default)]
struct EventCounters {
    total: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct EventShared {
    config: EventManagerConfig,
    sender: mpsc::Sender<MessageEvent>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    counters: EventCounters,
    running: AtomicBool,
    /// Messages accepted but not yet handled
    in_flight: watch::Sender<usize>,
    /// Handlers currently executing
    active_handlers: AtomicUsize,
}

/// Counts a handler as running for as long as it is alive
struct ActiveHandler<'a>(&'a AtomicUsize);

impl<'a> ActiveHandler<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveHandler<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EventManager {
    /// Create a stopped event manager
    pub fn new(config: EventManagerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (in_flight, _) = watch::channel(0);

        Self {
            shared: Arc::new(EventShared {
                config,
                sender,
                handlers: DashMap::new(),
                counters: EventCounters::default(),
                running: AtomicBool::new(false),
                in_flight,
                active_handlers: AtomicUsize::new(0),
            }),
            consumer: Mutex::new(ConsumerSlot {
                receiver: Some(receiver),
                running: None,
            }),
        }
    }

    /// Start the consumption loop. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut consumer = self.consumer.lock().await;
        if consumer.running.is_some() {
            debug!("Event manager already running");
            return;
        }
        let Some(receiver) = consumer.receiver.take() else {
            error!("Message receiver was lost; event manager cannot start");
            return;
        };

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consume_loop(
            Arc::clone(&self.shared),
            receiver,
            shutdown.clone(),
        ));

        self.shared.running.store(true, Ordering::SeqCst);
        consumer.running = Some(ConsumerHandle { shutdown, task });

        info!(
            "Event manager started (queue capacity {})",
            self.shared.config.queue_capacity
        );
    }

    /// Stop the consumption loop and wait for it to exit. A handler still in
    /// progress is abandoned and its message counted as failed. Undelivered
    /// messages stay queued.
    pub async fn stop(&self) {
        let mut consumer = self.consumer.lock().await;
        let Some(handle) = consumer.running.take() else {
            debug!("Event manager already stopped");
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        handle.shutdown.cancel();

        match handle.task.await {
            Ok(receiver) => consumer.receiver = Some(receiver),
            Err(e) => error!("Consumption loop terminated abnormally: {}", e),
        }

        info!("Event manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Associate a handler with a message type; the last registration wins
    pub fn register_message_handler<H>(&self, message_type: impl Into<String>, handler: H)
    where
        H: MessageHandler + 'static,
    {
        let message_type = message_type.into();
        if self
            .shared
            .handlers
            .insert(message_type.clone(), Arc::new(handler))
            .is_some()
        {
            debug!("Replaced handler for message type '{}'", message_type);
        } else {
            debug!("Registered handler for message type '{}'", message_type);
        }
    }

    pub fn unregister_message_handler(&self, message_type: &str) -> bool {
        self.shared.handlers.remove(message_type).is_some()
    }

    /// Message types with a registered handler, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .shared
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    /// Enqueue a message and return its event id without waiting for handling
    pub fn submit_message(
        &self,
        payload: MessagePayload,
        submitter_id: impl Into<String>,
    ) -> Result<String, EventError> {
        if !self.is_running() {
            return Err(EventError::NotRunning);
        }

        let event = MessageEvent::new(payload, submitter_id);
        let event_id = event.id.clone();
        let message_type = event.message_type().to_string();

        self.shared.in_flight.send_modify(|count| *count += 1);
        match self.shared.sender.try_send(event) {
            Ok(()) => {
                self.shared.counters.total.fetch_add(1, Ordering::SeqCst);
                debug!("Queued message {} of type '{}'", event_id, message_type);
                Ok(event_id)
            }
            Err(e) => {
                self.shared.settle();
                match e {
                    TrySendError::Full(_) => {
                        warn!("Rejected message of type '{}': queue full", message_type);
                        Err(EventError::QueueFull {
                            capacity: self.shared.config.queue_capacity,
                        })
                    }
                    TrySendError::Closed(_) => Err(EventError::NotRunning),
                }
            }
        }
    }

    /// Validate a raw JSON message and submit it
    pub fn submit_json(
        &self,
        value: serde_json::Value,
        submitter_id: impl Into<String>,
    ) -> Result<String, EventError> {
        let payload = MessagePayload::from_value(value)?;
        self.submit_message(payload, submitter_id)
    }

    pub fn get_stats(&self) -> EventStats {
        let counters = &self.shared.counters;
        let sender = &self.shared.sender;
        EventStats {
            total_messages: counters.total.load(Ordering::SeqCst),
            processed_messages: counters.processed.load(Ordering::SeqCst),
            failed_messages: counters.failed.load(Ordering::SeqCst),
            dropped_messages: counters.dropped.load(Ordering::SeqCst),
            queue_size: sender.max_capacity() - sender.capacity(),
            running_count: self.shared.active_handlers.load(Ordering::SeqCst),
            registered_handlers: self.shared.handlers.len(),
            is_running: self.is_running(),
        }
    }

    /// Resolve once every accepted message has been handled
    pub async fn wait_idle(&self) {
        let mut in_flight = self.shared.in_flight.subscribe();
        if in_flight.wait_for(|count| *count == 0).await.is_err() {
            warn!("In-flight channel closed while waiting for idle event manager");
        }
    }
}

impl EventShared {
    fn settle(&self) {
        self.in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    fn handler_timeout(&self) -> Option<Duration> {
        self.config.handler_timeout_secs.map(Duration::from_secs)
    }

    /// Account for a message whose handler was dropped by shutdown
    fn abandon(&self, event_id: &str) {
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        warn!("Abandoned message {}: event manager stopping", event_id);
        self.settle();
    }

    /// Run the handler registered for the event's type
    async fn dispatch(&self, event: MessageEvent) {
        let event_id = event.id.clone();
        let message_type = event.message_type().to_string();
        let handler = self
            .handlers
            .get(&message_type)
            .map(|entry| Arc::clone(entry.value()));

        let Some(handler) = handler else {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            warn!(
                "Dropped message {}: no handler for type '{}'",
                event_id, message_type
            );
            self.settle();
            return;
        };

        let result = {
            let _active = ActiveHandler::enter(&self.active_handlers);
            let run = AssertUnwindSafe(handler.handle(event)).catch_unwind();
            match self.handler_timeout() {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => Ok(Err(anyhow::anyhow!("handler timed out after {:?}", limit))),
                },
                None => run.await,
            }
        };

        match result {
            Ok(Ok(())) => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
                debug!("Handled message {} of type '{}'", event_id, message_type);
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    "Handler for '{}' failed on message {}: {:#}",
                    message_type, event_id, e
                );
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    "Handler for '{}' panicked on message {}",
                    message_type, event_id
                );
            }
        }

        self.settle();
    }
}

async fn consume_loop(
    shared: Arc<EventShared>,
    mut receiver: mpsc::Receiver<MessageEvent>,
    shutdown: CancellationToken,
) -> mpsc::Receiver<MessageEvent> {
    debug!("Consumption loop running");

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = receiver.recv() => event,
        };
        let Some(event) = event else {
            warn!("Message channel closed, consumption loop exiting");
            break;
        };

        let event_id = event.id.clone();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                shared.abandon(&event_id);
                break;
            }
            _ = shared.dispatch(event) => {}
        }
    }

    debug!("Consumption loop exited");
    receiver
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: env::DEFAULT_MESSAGE_QUEUE_CAPACITY,
            handler_timeout_secs: None,
        }
    }
}

impl EventManagerConfig {
    /// Check the configuration is usable
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("events.queue_capacity must be at least 1");
        }
        if self.handler_timeout_secs == Some(0) {
            anyhow::bail!("events.handler_timeout_secs must be positive when set");
        }
        Ok(())
    }
}
