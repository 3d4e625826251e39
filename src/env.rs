//! Constants, defaults and path utilities for taskhub.
//!
//! Centralizes configuration file names and the built-in defaults used by
//! the engine and event manager configuration types.

use std::path::{Path, PathBuf};

/// Application directory name (hidden directory like .git, .vscode)
pub const APP_DIR_NAME: &str = ".taskhub";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name when placed directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "taskhub.toml";

/// Default number of worker slots
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default bound on queued plus running tasks
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 1000;

/// Default bound on undelivered messages
pub const DEFAULT_MESSAGE_QUEUE_CAPACITY: usize = 1000;

/// Default retry budget for a new task
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause after an unexpected dispatch error
pub const DEFAULT_DISPATCH_BACKOFF_MS: u64 = 100;

/// Default time finished tasks are kept for introspection
pub const DEFAULT_COMPLETED_RETENTION_SECS: u64 = 3600;

/// Message type tags understood by the `taskhub` binary
pub mod messages {
    /// Message that becomes one engine task
    pub const TASK: &str = "task";

    /// Message that is only acknowledged in the log
    pub const PING: &str = "ping";
}

/// Build config file path directly in the current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

/// Build config file path inside the current directory's app directory
pub fn local_app_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    home_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.taskhub/config.toml")
        );

        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/taskhub.toml")
        );

        assert_eq!(
            local_app_config_file_path(current_dir),
            Path::new("/current/project/.taskhub/config.toml")
        );
    }
}
