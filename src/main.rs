//! omnisync CLI - dispatcher for the sync, copy and dedupe engines

use clap::Parser;
use omnisync::accounting::{Account, AccountHandle, ProgressGuard, PROGRESS_INTERVAL};
use omnisync::backend::make_backend;
use omnisync::config::{CliArgs, Commands, ConfigStore, RuntimeConfig, CONFIG_PASSWORD_VAR};
use omnisync::dedupe::{dedupe, DedupeMode};
use omnisync::error::{Result, SyncError};
use omnisync::ops;
use omnisync::prompt::{NonInteractivePrompt, Prompt, TerminalPrompt};
use omnisync::sync::{run_sync, SyncMode, SyncOptions};
use omnisync::transfer::RetryPolicy;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = CliArgs::parse();
    init_logging(&args);
    omnisync::tls::init();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn init_logging(args: &CliArgs) {
    let default = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: CliArgs) -> Result<i32> {
    let config = RuntimeConfig::from_cli(&args)?;
    let store = load_store(&config)?;
    let account = Account::new();

    dispatch(&args.command, &config, &store, &account)?;

    if !config.quiet {
        account.log_summary();
    }
    Ok(account.exit_code())
}

fn dispatch(
    command: &Commands,
    config: &RuntimeConfig,
    store: &ConfigStore,
    account: &AccountHandle,
) -> Result<()> {
    match command {
        Commands::Copy { source, dest } => {
            run_sync_command(SyncMode::Copy, source, dest, config, store, account)
        }
        Commands::Sync { source, dest } => {
            run_sync_command(SyncMode::Sync, source, dest, config, store, account)
        }
        Commands::Move { source, dest } => {
            run_sync_command(SyncMode::Move, source, dest, config, store, account)
        }
        Commands::Dedupe { first, second } => {
            let (mode, remote) = match second {
                Some(remote) => (first.parse::<DedupeMode>()?, remote.as_str()),
                None => (config.dedupe_mode, first.as_str()),
            };
            let fs = make_backend(remote, store)?;
            let prompt: Box<dyn Prompt> =
                if mode == DedupeMode::Interactive && std::io::stdin().is_terminal() {
                    Box::new(TerminalPrompt::new())
                } else {
                    Box::new(NonInteractivePrompt)
                };
            dedupe(fs, mode, prompt.as_ref(), config.dry_run, account)
        }
        Commands::Ls { remote } => {
            let fs = make_backend(remote, store)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            ops::list_objects(fs, &mut out)?;
            out.flush().ok();
            Ok(())
        }
        Commands::Lsl { remote } => {
            let fs = make_backend(remote, store)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            ops::list_long(fs, &mut out)?;
            out.flush().ok();
            Ok(())
        }
        Commands::Lsd { remote } => {
            let fs = make_backend(remote, store)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            ops::list_dirs(fs, &mut out)?;
            out.flush().ok();
            Ok(())
        }
        Commands::Mkdir { remote } => {
            let fs = make_backend(remote, store)?;
            ops::mkdir(&fs)
        }
        Commands::Rmdir { remote } => {
            let fs = make_backend(remote, store)?;
            ops::rmdir(&fs)
        }
        Commands::Purge { remote } => {
            let fs = make_backend(remote, store)?;
            ops::purge(&fs, config.dry_run, account)
        }
        Commands::Check { source, dest } => {
            let src_fs = make_backend(source, store)?;
            let dst_fs = make_backend(dest, store)?;
            let report = ops::check(src_fs, dst_fs, account)?;
            if report.differences() > 0 {
                return Err(SyncError::fatal(format!(
                    "{} differences found",
                    report.differences()
                )));
            }
            tracing::info!("{} matching files", report.matches);
            Ok(())
        }
        Commands::Cleanup { remote } => {
            let fs = make_backend(remote, store)?;
            ops::cleanup(&fs)
        }
    }
}

fn run_sync_command(
    mode: SyncMode,
    source: &str,
    dest: &str,
    config: &RuntimeConfig,
    store: &ConfigStore,
    account: &AccountHandle,
) -> Result<()> {
    let src_fs = make_backend(source, store)?;
    let dst_fs = make_backend(dest, store)?;

    let options = SyncOptions {
        mode,
        transfers: config.transfers,
        checkers: config.checkers,
        low_level_retries: config.low_level_retries,
        dry_run: config.dry_run,
        track_renames: config.track_renames,
        filter: Arc::clone(&config.filter),
        policy: Some(RetryPolicy::with_retries(config.low_level_retries)),
    };

    let show_bar = !config.quiet && std::io::stderr().is_terminal();
    let progress = (!config.quiet)
        .then(|| ProgressGuard::start(account.clone(), PROGRESS_INTERVAL, show_bar));

    let result = run_sync(src_fs, dst_fs, options, account.clone());
    drop(progress);
    result
}

/// Load the remote store, resolving the password from the environment
/// or, when permitted, the terminal.
fn load_store(config: &RuntimeConfig) -> Result<ConfigStore> {
    let path = ConfigStore::default_path(config.config_path.as_deref());
    let mut password = std::env::var(CONFIG_PASSWORD_VAR).ok();

    if password.is_none() && ConfigStore::is_encrypted(&path) {
        if config.ask_password && std::io::stdin().is_terminal() {
            password = Some(read_password()?);
        } else {
            return Err(SyncError::config(format!(
                "config file is encrypted; set {CONFIG_PASSWORD_VAR}"
            )));
        }
    }

    ConfigStore::load(&path, password.as_deref())
}

fn read_password() -> Result<String> {
    let mut err = std::io::stderr();
    let _ = write!(err, "Enter configuration password: ");
    let _ = err.flush();

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| SyncError::config(format!("reading password: {e}")))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
