//! Built-in message routes for the `taskhub run` command
//!
//! - `task`: becomes one engine task. Recognised fields are `name`,
//!   `description`, `priority`, `max_retries`, `delay_ms` and `fail`; every
//!   other field is passed through as task input and echoed back as output.
//! - `ping`: logged and acknowledged, no task is created.

use crate::env::messages;
use crate::events::{MessageEvent, handler_fn};
use crate::integration::TaskService;
use crate::task::{Task, TaskBody, TaskInput, TaskPriority};
use anyhow::{Result, anyhow};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

const CONTROL_FIELDS: [&str; 6] = [
    "name",
    "description",
    "priority",
    "max_retries",
    "delay_ms",
    "fail",
];

/// Register the `task` and `ping` routes on `service`
pub fn install_default_routes(service: &TaskService) {
    service.route(messages::TASK, |event| Ok(vec![task_from_message(event)?]));

    service.events().register_message_handler(
        messages::PING,
        handler_fn(|event: MessageEvent| async move {
            info!("ping {} from {}", event.id, event.submitter_id);
            Ok(())
        }),
    );
}

/// Build a task and its input from a `task` message
pub fn task_from_message(event: &MessageEvent) -> Result<(Task, TaskInput)> {
    let payload = &event.payload;

    let name = match payload.get("name") {
        None => format!("task-{}", event.id),
        Some(Value::String(name)) => name.clone(),
        Some(_) => return Err(anyhow!("\"name\" must be a string")),
    };

    let priority = match payload.get("priority") {
        None => TaskPriority::default(),
        Some(Value::String(level)) => level.parse::<TaskPriority>().map_err(|e| anyhow!(e))?,
        Some(_) => return Err(anyhow!("\"priority\" must be a string")),
    };

    let delay = match payload.get("delay_ms") {
        None => None,
        Some(value) => Some(Duration::from_millis(
            value
                .as_u64()
                .ok_or_else(|| anyhow!("\"delay_ms\" must be a non-negative integer"))?,
        )),
    };

    let fail = match payload.get("fail") {
        None => false,
        Some(value) => value
            .as_bool()
            .ok_or_else(|| anyhow!("\"fail\" must be a boolean"))?,
    };

    let mut task = Task::new(name, echo_body(delay, fail)).with_priority(priority);
    if let Some(description) = payload.get("description").and_then(Value::as_str) {
        task = task.with_description(description);
    }
    if let Some(max_retries) = payload.get("max_retries") {
        let max_retries = max_retries
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| anyhow!("\"max_retries\" must be a small non-negative integer"))?;
        task = task.with_max_retries(max_retries);
    }

    let mut input = TaskInput::new()
        .with_metadata("message_id", event.id.clone())
        .with_metadata("submitter_id", event.submitter_id.clone());
    for (key, value) in &payload.data {
        if !CONTROL_FIELDS.contains(&key.as_str()) {
            input = input.with_field(key.clone(), value.clone());
        }
    }

    Ok((task, input))
}

fn echo_body(delay: Option<Duration>, fail: bool) -> TaskBody {
    TaskBody::from_fn(move |input: TaskInput| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            anyhow::bail!("task requested failure");
        }
        Ok(Value::Object(input.data))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MessagePayload;
    use serde_json::json;

    fn event(value: Value) -> MessageEvent {
        MessageEvent::new(MessagePayload::from_value(value).unwrap(), "tester")
    }

    #[test]
    fn test_task_from_message_fields() {
        let event = event(json!({
            "type": "task",
            "name": "resize",
            "priority": "high",
            "max_retries": 1,
            "width": 640
        }));

        let (task, input) = task_from_message(&event).unwrap();
        assert_eq!(task.name, "resize");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.max_retries, 1);
        assert_eq!(input.get("width"), Some(&json!(640)));
        assert!(input.get("priority").is_none());
        assert_eq!(input.metadata.get("submitter_id").unwrap(), "tester");
    }

    #[test]
    fn test_task_from_message_defaults() {
        let event = event(json!({ "type": "task" }));

        let (task, input) = task_from_message(&event).unwrap();
        assert_eq!(task.name, format!("task-{}", event.id));
        assert_eq!(task.priority, TaskPriority::Normal);
        assert!(input.data.is_empty());
    }

    #[test]
    fn test_task_from_message_rejects_bad_priority() {
        let event = event(json!({ "type": "task", "priority": "urgent" }));
        assert!(task_from_message(&event).is_err());

        let event = event_with_delay(json!("soon"));
        assert!(task_from_message(&event).is_err());
    }

    fn event_with_delay(delay: Value) -> MessageEvent {
        event(json!({ "type": "task", "delay_ms": delay }))
    }

    #[tokio::test]
    async fn test_echo_body_round_trip() {
        let body = echo_body(None, false);
        let input = TaskInput::new().with_field("x", json!(1));
        assert_eq!(body.run(input).await.unwrap(), json!({ "x": 1 }));

        let failing = echo_body(Some(Duration::from_millis(1)), true);
        let error = failing.run(TaskInput::new()).await.unwrap_err();
        assert!(error.to_string().contains("requested failure"));
    }
}
