use taskhub::integration::ServiceConfig;
use tempfile::NamedTempFile;

#[test]
fn test_config_serialization_roundtrip() {
    let original_config = ServiceConfig::default();

    // Test serialization to TOML string
    let toml_str = original_config
        .to_toml_string()
        .expect("Should be able to serialize config to TOML");

    assert!(!toml_str.is_empty(), "TOML string should not be empty");
    assert!(toml_str.contains("[engine]"), "Should contain engine table");
    assert!(toml_str.contains("worker_count"), "Should contain worker_count field");

    // Test deserialization from TOML string
    let deserialized_config = ServiceConfig::from_toml_str(&toml_str)
        .expect("Should be able to deserialize TOML string");

    assert_eq!(
        original_config.engine.worker_count,
        deserialized_config.engine.worker_count
    );
    assert_eq!(
        original_config.engine.queue_capacity,
        deserialized_config.engine.queue_capacity
    );
    assert_eq!(
        original_config.engine.completed_retention_secs,
        deserialized_config.engine.completed_retention_secs
    );
    assert_eq!(
        original_config.events.queue_capacity,
        deserialized_config.events.queue_capacity
    );
    assert_eq!(
        original_config.events.handler_timeout_secs,
        deserialized_config.events.handler_timeout_secs
    );
}

#[test]
fn test_config_file_operations() {
    let mut original_config = ServiceConfig::default();
    original_config.engine.worker_count = 8;
    original_config.engine.completed_retention_secs = 0;
    original_config.events.handler_timeout_secs = Some(30);

    let temp_file = NamedTempFile::new().expect("Should be able to create temporary file");
    let temp_path = temp_file.path();

    original_config
        .to_toml_file(temp_path)
        .expect("Should be able to save config to file");

    let loaded_config =
        ServiceConfig::from_toml_file(temp_path).expect("Should be able to load config from file");

    assert_eq!(loaded_config.engine.worker_count, 8);
    assert_eq!(loaded_config.engine.completed_retention_secs, 0);
    assert_eq!(loaded_config.events.handler_timeout_secs, Some(30));
    assert_eq!(
        original_config.events.queue_capacity,
        loaded_config.events.queue_capacity
    );
}

#[test]
fn test_partial_config_uses_defaults() {
    let config = ServiceConfig::from_toml_str(
        r#"
[engine]
queue_capacity = 5

[events]
handler_timeout_secs = 2
"#,
    )
    .expect("Partial config should parse");

    let defaults = ServiceConfig::default();
    assert_eq!(config.engine.queue_capacity, 5);
    assert_eq!(config.engine.worker_count, defaults.engine.worker_count);
    assert_eq!(config.events.queue_capacity, defaults.events.queue_capacity);
    assert_eq!(config.events.handler_timeout_secs, Some(2));

    let empty = ServiceConfig::from_toml_str("").expect("Empty config should parse");
    assert_eq!(empty.engine.worker_count, defaults.engine.worker_count);
}

#[test]
fn test_invalid_config_rejected() {
    assert!(ServiceConfig::from_toml_str("[engine]\nworker_count = 0\n").is_err());
    assert!(ServiceConfig::from_toml_str("[events]\nqueue_capacity = 0\n").is_err());
    assert!(ServiceConfig::from_toml_str("[engine]\nworker_count = \"many\"\n").is_err());
    assert!(ServiceConfig::from_toml_file("/nonexistent/taskhub.toml").is_err());
}
