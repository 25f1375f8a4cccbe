//! CLI arguments and runtime settings
//!
//! Defines the command surface, the shared flags, and the validated
//! runtime configuration derived from them.

use crate::dedupe::DedupeMode;
use crate::error::{Result, SyncError};
use crate::filter::Filter;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// omnisync - multi-backend file synchronization and dedupe
#[derive(Parser, Debug)]
#[command(name = "omnisync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sync, copy and reconcile objects between object stores")]
#[command(long_about = r#"
omnisync copies, moves and reconciles objects between heterogeneous
object stores: local filesystems and configured remote stores.

Examples:
  omnisync copy /data backup:data          # copy, skipping identical
  omnisync sync /data backup:data          # make destination identical
  omnisync dedupe rename drive:photos      # resolve duplicate names
  omnisync check /data backup:data         # compare without copying
"#)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Number of concurrent transfers
    #[arg(long, default_value = "4", value_name = "N", global = true)]
    pub transfers: usize,

    /// Number of concurrent listing/checking tasks
    #[arg(long, default_value = "8", value_name = "N", global = true)]
    pub checkers: usize,

    /// Attempts per transfer before giving up
    #[arg(long, default_value = "10", value_name = "N", global = true)]
    pub low_level_retries: usize,

    /// Trial run: log every decision, change nothing
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    /// Verbose output (repeat for more detail)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Dump HTTP headers when talking to remote stores
    #[arg(long, global = true)]
    pub dump_headers: bool,

    /// Dump HTTP bodies when talking to remote stores
    #[arg(long, global = true)]
    pub dump_bodies: bool,

    /// Glob pattern of objects to include (repeatable)
    #[arg(long, value_name = "PATTERN", global = true)]
    pub include: Vec<String>,

    /// Glob pattern of objects to exclude (repeatable)
    #[arg(long, value_name = "PATTERN", global = true)]
    pub exclude: Vec<String>,

    /// Turn matching copy+delete pairs into renames during sync
    #[arg(long, global = true)]
    pub track_renames: bool,

    /// How dedupe resolves surviving duplicates
    #[arg(long, value_enum, default_value = "interactive", global = true)]
    pub dedupe_mode: DedupeMode,

    /// Allow reading the config password from the terminal
    #[arg(
        long,
        default_value = "true",
        value_name = "BOOL",
        action = clap::ArgAction::Set,
        global = true
    )]
    pub ask_password: bool,

    /// Config file location
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Copy source to destination, skipping identical objects
    Copy {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        dest: String,
    },

    /// Make destination identical to source, deleting extras
    Sync {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        dest: String,
    },

    /// Copy source to destination, then delete the sources
    Move {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        dest: String,
    },

    /// Find duplicate names and delete or rename them
    Dedupe {
        /// Mode (interactive|skip|first|newest|oldest|rename) or the
        /// remote when only one argument is given
        #[arg(value_name = "MODE|REMOTE")]
        first: String,
        /// Remote to scan
        #[arg(value_name = "REMOTE")]
        second: Option<String>,
    },

    /// List objects with size and path
    Ls {
        /// Remote to list
        remote: String,
    },

    /// List objects with size, modification time and path
    Lsl {
        /// Remote to list
        remote: String,
    },

    /// List top-level directories
    Lsd {
        /// Remote to list
        remote: String,
    },

    /// Create the root directory
    Mkdir {
        /// Remote to create
        remote: String,
    },

    /// Remove the root directory; fails unless empty
    Rmdir {
        /// Remote to remove
        remote: String,
    },

    /// Delete the remote's whole tree
    Purge {
        /// Remote to purge
        remote: String,
    },

    /// Compare source and destination without copying
    Check {
        /// Source remote or path
        source: String,
        /// Destination remote or path
        dest: String,
    },

    /// Empty the remote's trash, where supported
    Cleanup {
        /// Remote to clean up
        remote: String,
    },
}

/// Validated runtime configuration shared by every subcommand
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Concurrent transfers
    pub transfers: usize,
    /// Concurrent checkers
    pub checkers: usize,
    /// Attempts per transfer
    pub low_level_retries: usize,
    /// Trial run
    pub dry_run: bool,
    /// Verbosity level
    pub verbose: u8,
    /// Suppress output
    pub quiet: bool,
    /// HTTP header dumping for remote stores
    pub dump_headers: bool,
    /// HTTP body dumping for remote stores
    pub dump_bodies: bool,
    /// Rename detection during sync
    pub track_renames: bool,
    /// Dedupe resolution mode
    pub dedupe_mode: DedupeMode,
    /// May prompt for the config password
    pub ask_password: bool,
    /// Config file override
    pub config_path: Option<PathBuf>,
    /// Compiled include/exclude rules
    pub filter: Arc<Filter>,
}

impl RuntimeConfig {
    /// Validate CLI arguments into a runtime configuration
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        if args.transfers == 0 {
            return Err(SyncError::Usage("--transfers must be at least 1".into()));
        }
        if args.checkers == 0 {
            return Err(SyncError::Usage("--checkers must be at least 1".into()));
        }
        if args.low_level_retries == 0 {
            return Err(SyncError::Usage(
                "--low-level-retries must be at least 1".into(),
            ));
        }

        let filter = Filter::new(&args.include, &args.exclude)?;

        Ok(Self {
            transfers: args.transfers,
            checkers: args.checkers,
            low_level_retries: args.low_level_retries,
            dry_run: args.dry_run,
            verbose: args.verbose,
            quiet: args.quiet,
            dump_headers: args.dump_headers,
            dump_bodies: args.dump_bodies,
            track_renames: args.track_renames,
            dedupe_mode: args.dedupe_mode,
            ask_password: args.ask_password,
            config_path: args.config.clone(),
            filter: Arc::new(filter),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["omnisync", "copy", "/a", "/b"]);
        let config = RuntimeConfig::from_cli(&args).unwrap();
        assert_eq!(config.transfers, 4);
        assert_eq!(config.checkers, 8);
        assert_eq!(config.low_level_retries, 10);
        assert!(!config.dry_run);
        assert!(config.ask_password);
        assert_eq!(config.dedupe_mode, DedupeMode::Interactive);
    }

    #[test]
    fn test_flags_after_subcommand() {
        let args = parse(&[
            "omnisync",
            "sync",
            "/a",
            "b:c",
            "--transfers",
            "16",
            "--dry-run",
            "--exclude",
            "*.tmp",
        ]);
        let config = RuntimeConfig::from_cli(&args).unwrap();
        assert_eq!(config.transfers, 16);
        assert!(config.dry_run);
        assert!(!config.filter.matches("x.tmp"));
        assert!(matches!(args.command, Commands::Sync { .. }));
    }

    #[test]
    fn test_zero_transfers_is_usage_error() {
        let args = parse(&["omnisync", "copy", "/a", "/b", "--transfers", "0"]);
        let err = RuntimeConfig::from_cli(&args).unwrap_err();
        assert!(matches!(err, SyncError::Usage(_)));
        assert_eq!(err.exit_code(), crate::error::exit_code::USAGE);
    }

    #[test]
    fn test_dedupe_mode_flag() {
        let args = parse(&[
            "omnisync",
            "dedupe",
            "drive:dupes",
            "--dedupe-mode",
            "rename",
        ]);
        assert_eq!(args.dedupe_mode, DedupeMode::Rename);
        match args.command {
            Commands::Dedupe { first, second } => {
                assert_eq!(first, "drive:dupes");
                assert!(second.is_none());
            }
            _ => panic!("expected dedupe"),
        }
    }

    #[test]
    fn test_dedupe_positional_mode() {
        let args = parse(&["omnisync", "dedupe", "rename", "drive:dupes"]);
        match args.command {
            Commands::Dedupe { first, second } => {
                assert_eq!(first, "rename");
                assert_eq!(second.as_deref(), Some("drive:dupes"));
            }
            _ => panic!("expected dedupe"),
        }
    }

    #[test]
    fn test_ask_password_flag() {
        let args = parse(&["omnisync", "ls", "r:", "--ask-password", "false"]);
        assert!(!args.ask_password);
    }
}
