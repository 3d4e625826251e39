//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Feed newline-delimited JSON messages through the service
//! - `show-config`: Show the effective configuration and where it came from

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig { config_override: Option<PathBuf> },
}

/// Where `run` reads messages from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    Stdin,
    File(PathBuf),
}

#[derive(Debug)]
pub struct RunConfig {
    pub source: MessageSource,
    pub config_override: Option<PathBuf>,
    pub submitter_id: String,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "taskhub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Priority task engine fed by a typed message queue")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Submit newline-delimited JSON messages and wait for all resulting tasks
    Run {
        /// Message file, or `-` for stdin
        input: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Submitter id attached to every message
        #[arg(short = 's', long = "submitter", default_value = "cli")]
        submitter: String,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// Show configuration discovery information and the effective configuration
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                input,
                config,
                submitter,
                verbose,
            }) => {
                let submitter_id = submitter.trim();
                if submitter_id.is_empty() {
                    return Err("Submitter id must not be empty".to_string());
                }

                Ok(ExecutionMode::Run(RunConfig {
                    source: Self::detect_source(input),
                    config_override: config.clone(),
                    submitter_id: submitter_id.to_string(),
                    verbose: *verbose,
                }))
            }
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
            }),
            None => Err(
                "No command specified. Use 'taskhub --help' to see available commands."
                    .to_string(),
            ),
        }
    }

    fn detect_source(input: &std::path::Path) -> MessageSource {
        if input.as_os_str() == "-" {
            MessageSource::Stdin
        } else {
            MessageSource::File(input.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_with_file() {
        let args = Args {
            command: Some(Commands::Run {
                input: PathBuf::from("messages.jsonl"),
                config: None,
                submitter: "tester".to_string(),
                verbose: true,
            }),
        };

        match args.mode().unwrap() {
            ExecutionMode::Run(config) => {
                assert_eq!(
                    config.source,
                    MessageSource::File(PathBuf::from("messages.jsonl"))
                );
                assert_eq!(config.submitter_id, "tester");
                assert!(config.verbose);
            }
            other => panic!("Expected run mode, got {:?}", other),
        }
    }

    #[test]
    fn test_run_command_with_stdin() {
        let args = Args::try_parse_from(["taskhub", "run", "-"]).unwrap();

        match args.mode().unwrap() {
            ExecutionMode::Run(config) => {
                assert_eq!(config.source, MessageSource::Stdin);
                assert_eq!(config.submitter_id, "cli");
                assert!(!config.verbose);
            }
            other => panic!("Expected run mode, got {:?}", other),
        }
    }

    #[test]
    fn test_blank_submitter_rejected() {
        let args = Args::try_parse_from(["taskhub", "run", "-", "--submitter", "  "]).unwrap();
        assert!(args.mode().is_err());
    }

    #[test]
    fn test_show_config_with_override() {
        let args =
            Args::try_parse_from(["taskhub", "show-config", "--config", "custom.toml"]).unwrap();

        match args.mode().unwrap() {
            ExecutionMode::ShowConfig { config_override } => {
                assert_eq!(config_override, Some(PathBuf::from("custom.toml")));
            }
            other => panic!("Expected show-config mode, got {:?}", other),
        }
    }

    #[test]
    fn test_no_command() {
        let args = Args { command: None };
        assert!(args.mode().is_err());
    }
}
