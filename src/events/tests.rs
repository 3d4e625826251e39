#[cfg(test)]
mod tests {
    use crate::events::manager::*;
    use crate::events::types::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn create_test_manager(queue_capacity: usize) -> EventManager {
        EventManager::new(EventManagerConfig {
            queue_capacity,
            ..EventManagerConfig::default()
        })
    }

    async fn started_manager(queue_capacity: usize) -> EventManager {
        let manager = create_test_manager(queue_capacity);
        manager.start().await;
        manager
    }

    async fn wait_idle(manager: &EventManager) {
        timeout(WAIT, manager.wait_idle())
            .await
            .expect("event manager did not become idle in time");
    }

    /// Handler that counts invocations
    fn counting_handler(counter: &Arc<AtomicUsize>) -> impl MessageHandler + 'static {
        let counter = Arc::clone(counter);
        handler_fn(move |_event: MessageEvent| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_payload_from_value() {
        let payload = MessagePayload::from_value(json!({ "type": "ping", "seq": 7 })).unwrap();
        assert_eq!(payload.message_type, "ping");
        assert_eq!(payload.get("seq"), Some(&json!(7)));
        assert!(payload.get("type").is_none());
        assert_eq!(payload.to_value(), json!({ "type": "ping", "seq": 7 }));
    }

    #[test]
    fn test_payload_validation() {
        assert!(matches!(
            MessagePayload::from_value(json!(["ping"])),
            Err(EventError::InvalidPayload(_))
        ));
        assert!(matches!(
            MessagePayload::from_value(json!({ "seq": 1 })),
            Err(EventError::InvalidPayload(_))
        ));
        assert!(matches!(
            MessagePayload::from_value(json!({ "type": " " })),
            Err(EventError::InvalidPayload(_))
        ));
        assert!(matches!(
            MessagePayload::from_value(json!({ "type": 3 })),
            Err(EventError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_payload_serde_flattens_fields() {
        let payload = MessagePayload::new("resize").with_field("width", json!(640));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({ "type": "resize", "width": 640 }));

        let parsed: MessagePayload = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_message_event_wraps_payload() {
        let event = MessageEvent::new(MessagePayload::new("ping"), "client-1");
        assert_eq!(event.message_type(), "ping");
        assert_eq!(event.submitter_id, "client-1");
        assert!(uuid::Uuid::parse_str(&event.id).is_ok());

        let other = MessageEvent::new(MessagePayload::new("ping"), "client-1");
        assert_ne!(event.id, other.id);
    }

    #[tokio::test]
    async fn test_submit_requires_running_manager() {
        let manager = create_test_manager(10);

        let result = manager.submit_message(MessagePayload::new("ping"), "client");
        assert_eq!(result, Err(EventError::NotRunning));

        manager.start().await;
        manager.stop().await;

        let result = manager.submit_message(MessagePayload::new("ping"), "client");
        assert_eq!(result, Err(EventError::NotRunning));
        assert_eq!(manager.get_stats().total_messages, 0);
    }

    #[tokio::test]
    async fn test_handler_receives_event() {
        let manager = started_manager(10).await;
        let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
        manager.register_message_handler(
            "ping",
            handler_fn(move |event: MessageEvent| {
                let sender = sender.clone();
                async move {
                    sender.send(event)?;
                    Ok(())
                }
            }),
        );

        let event_id = manager
            .submit_message(
                MessagePayload::new("ping").with_field("seq", json!(1)),
                "client-1",
            )
            .unwrap();

        let event = timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(event.id, event_id);
        assert_eq!(event.submitter_id, "client-1");
        assert_eq!(event.payload.get("seq"), Some(&json!(1)));

        wait_idle(&manager).await;
        let stats = manager.get_stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.processed_messages, 1);
        assert_eq!(stats.failed_messages, 0);
        assert_eq!(stats.running_count, 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unregistered_type_is_dropped_and_counted() {
        let manager = started_manager(10).await;
        let pings = Arc::new(AtomicUsize::new(0));
        manager.register_message_handler("ping", counting_handler(&pings));

        manager
            .submit_message(MessagePayload::new("pong"), "client")
            .unwrap();
        wait_idle(&manager).await;

        let stats = manager.get_stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.failed_messages, 1);
        assert_eq!(stats.dropped_messages, 1);
        assert_eq!(stats.processed_messages, 0);
        assert_eq!(pings.load(Ordering::SeqCst), 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_are_counted() {
        let manager = started_manager(10).await;
        manager.register_message_handler(
            "fails",
            handler_fn(|_event: MessageEvent| async move {
                Err(anyhow::anyhow!("handler refused"))
            }),
        );
        manager.register_message_handler(
            "panics",
            handler_fn(|_event: MessageEvent| async move {
                let explode = true;
                if explode {
                    panic!("handler exploded");
                }
                Ok(())
            }),
        );
        let pings = Arc::new(AtomicUsize::new(0));
        manager.register_message_handler("ping", counting_handler(&pings));

        manager.submit_message(MessagePayload::new("fails"), "client").unwrap();
        manager.submit_message(MessagePayload::new("panics"), "client").unwrap();
        manager.submit_message(MessagePayload::new("ping"), "client").unwrap();
        wait_idle(&manager).await;

        // The loop keeps going after a failing handler
        let stats = manager.get_stats();
        assert!(stats.is_running);
        assert_eq!(stats.failed_messages, 2);
        assert_eq!(stats.dropped_messages, 0);
        assert_eq!(stats.processed_messages, 1);
        assert_eq!(pings.load(Ordering::SeqCst), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let manager = started_manager(10).await;
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        manager.register_message_handler("ping", counting_handler(&first));
        manager.register_message_handler("ping", counting_handler(&second));
        assert_eq!(manager.get_stats().registered_handlers, 1);

        manager.submit_message(MessagePayload::new("ping"), "client").unwrap();
        wait_idle(&manager).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unregister_and_registered_types() {
        let manager = started_manager(10).await;
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register_message_handler("pong", counting_handler(&counter));
        manager.register_message_handler("ping", counting_handler(&counter));
        assert_eq!(manager.registered_types(), vec!["ping", "pong"]);

        assert!(manager.unregister_message_handler("ping"));
        assert!(!manager.unregister_message_handler("ping"));
        assert_eq!(manager.registered_types(), vec!["pong"]);

        manager.submit_message(MessagePayload::new("ping"), "client").unwrap();
        wait_idle(&manager).await;
        assert_eq!(manager.get_stats().dropped_messages, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_counting() {
        let manager = started_manager(1).await;
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());

        let handler_started = Arc::clone(&started);
        let handler_gate = Arc::clone(&gate);
        manager.register_message_handler(
            "slow",
            handler_fn(move |_event: MessageEvent| {
                let started = Arc::clone(&handler_started);
                let gate = Arc::clone(&handler_gate);
                async move {
                    started.notify_one();
                    gate.notified().await;
                    Ok(())
                }
            }),
        );

        // First message is taken by the consumer and blocks in the handler
        manager.submit_message(MessagePayload::new("slow"), "client").unwrap();
        timeout(WAIT, started.notified()).await.unwrap();

        // Second fills the only queue slot
        manager.submit_message(MessagePayload::new("slow"), "client").unwrap();
        assert_eq!(manager.get_stats().queue_size, 1);

        let rejected = manager.submit_message(MessagePayload::new("slow"), "client");
        assert_eq!(rejected, Err(EventError::QueueFull { capacity: 1 }));
        assert_eq!(manager.get_stats().total_messages, 2);

        gate.notify_one();
        timeout(WAIT, started.notified()).await.unwrap();
        gate.notify_one();
        wait_idle(&manager).await;

        let stats = manager.get_stats();
        assert_eq!(stats.processed_messages, 2);
        assert_eq!(stats.queue_size, 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_submit_json() {
        let manager = started_manager(10).await;
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register_message_handler("ping", counting_handler(&counter));

        assert!(manager.submit_json(json!({ "type": "ping" }), "client").is_ok());
        assert!(matches!(
            manager.submit_json(json!({ "kind": "ping" }), "client"),
            Err(EventError::InvalidPayload(_))
        ));
        wait_idle(&manager).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_stats().total_messages, 1);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let manager = EventManager::new(EventManagerConfig {
            queue_capacity: 10,
            handler_timeout_secs: Some(1),
        });
        manager.start().await;
        manager.register_message_handler(
            "slow",
            handler_fn(|_event: MessageEvent| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );

        manager.submit_message(MessagePayload::new("slow"), "client").unwrap();
        wait_idle(&manager).await;

        let stats = manager.get_stats();
        assert_eq!(stats.failed_messages, 1);
        assert_eq!(stats.processed_messages, 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_abandons_stuck_handler() {
        let manager = started_manager(10).await;
        let entered = Arc::new(Notify::new());

        let handler_entered = Arc::clone(&entered);
        manager.register_message_handler(
            "stuck",
            handler_fn(move |_event: MessageEvent| {
                let entered = Arc::clone(&handler_entered);
                async move {
                    entered.notify_one();
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }),
        );

        manager.submit_message(MessagePayload::new("stuck"), "client").unwrap();
        timeout(WAIT, entered.notified()).await.unwrap();
        assert_eq!(manager.get_stats().running_count, 1);

        timeout(Duration::from_secs(2), manager.stop())
            .await
            .expect("stop should not wait for a stuck handler");

        let stats = manager.get_stats();
        assert!(!stats.is_running);
        assert_eq!(stats.running_count, 0);
        assert_eq!(stats.failed_messages, 1);
        assert_eq!(stats.processed_messages, 0);
        wait_idle(&manager).await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let manager = create_test_manager(10);
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register_message_handler("ping", counting_handler(&counter));

        manager.start().await;
        manager.start().await;
        assert!(manager.is_running());
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());

        manager.start().await;
        manager.submit_message(MessagePayload::new("ping"), "client").unwrap();
        wait_idle(&manager).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        manager.stop().await;
    }

    #[test]
    fn test_config_validation() {
        assert!(EventManagerConfig::default().validate().is_ok());

        let no_capacity = EventManagerConfig {
            queue_capacity: 0,
            ..EventManagerConfig::default()
        };
        assert!(no_capacity.validate().is_err());

        let zero_timeout = EventManagerConfig {
            handler_timeout_secs: Some(0),
            ..EventManagerConfig::default()
        };
        assert!(zero_timeout.validate().is_err());
    }
}
