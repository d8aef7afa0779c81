//! CLI argument parsing for bc

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bc")]
#[command(author, version, about = "In-process N:M broadcaster demo", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Broadcast words to a set of listeners and print what each received
    Run {
        /// Number of listeners to register
        #[arg(short = 'n', long, default_value = "3")]
        listeners: usize,

        /// Words to broadcast, in order
        #[arg(default_values_t = ["this".to_string(), "is".to_string(), "a".to_string(), "test".to_string()])]
        words: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["bc", "run"]).unwrap();
        match cli.command {
            Command::Run { listeners, words } => {
                assert_eq!(listeners, 3);
                assert_eq!(words, vec!["this", "is", "a", "test"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_args() {
        let cli = Cli::try_parse_from(["bc", "-l", "debug", "run", "-n", "5", "hello", "world"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Run { listeners, words } => {
                assert_eq!(listeners, 5);
                assert_eq!(words, vec!["hello", "world"]);
            }
            _ => panic!("Expected Run command"),
        }
    }
}
