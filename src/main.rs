//! `process-monitor` - Command-line process lifecycle monitor
//!
//! Prints every process start and stop observed on the system. Processes named
//! with `--watch` (or listed in the configuration file) additionally get start
//! and stop callbacks that honor the single-start / single-stop rules.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use process_monitor::{
    ConfigManager, ProcessEvent, ProcessMonitor, SourceKind, WatchedProcess,
    get_user_friendly_error, utils,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How often the main loop re-checks the deadline and quit signal
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    /// WMI event subscriptions (Windows)
    Wmi,
    /// Periodic process snapshots
    Polling,
}

impl From<SourceArg> for SourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Wmi => SourceKind::Wmi,
            SourceArg::Polling => SourceKind::Polling,
        }
    }
}

/// Watch process starts and stops
#[derive(Debug, Parser)]
#[command(name = "process-monitor", version, about)]
struct Cli {
    /// Configuration file (default: %APPDATA%\ProcessMonitor\config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Notification source, overriding the configuration
    #[arg(long, value_enum)]
    source: Option<SourceArg>,

    /// Process name to track with start/stop callbacks (repeatable)
    #[arg(long = "watch", value_name = "NAME")]
    watch: Vec<String>,

    /// Fire the start callback only for the first instance of a watched process
    #[arg(long)]
    single_start: bool,

    /// Fire the stop callback only when the last instance exits
    #[arg(long)]
    single_stop: bool,

    /// Stop after this many seconds (default: run until Enter is pressed)
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging().context("Failed to initialize logging system")?;

    let mut config = match &cli.config {
        Some(path) => ConfigManager::load_from(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(source) = cli.source {
        config.settings.source = source.into();
    }
    config
        .watched_processes
        .extend(cli.watch.iter().map(|name| WatchedProcess {
            process_name: name.clone(),
            allow_multiple_start_callbacks: !cli.single_start,
            allow_multiple_stop_callbacks: !cli.single_stop,
        }));

    let monitor = ProcessMonitor::from_settings(&config.settings);
    let events = monitor.subscribe();

    let json = cli.json;
    let started = if config.watched_processes.is_empty() {
        monitor.start_global()
    } else {
        monitor.start_watching(
            &config.watched_processes,
            move |event| print_callback("start", event, json),
            move |event| print_callback("stop", event, json),
        )
    };
    if let Err(e) = started {
        error!("Failed to start monitoring: {e}");
        eprintln!("{}", get_user_friendly_error(&e));
        monitor.cleanup();
        return Err(e).context("Failed to start process monitoring");
    }

    let deadline = cli
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let (quit_tx, quit_rx) = mpsc::channel::<()>();
    if deadline.is_none() {
        eprintln!("Monitoring process events, press Enter to stop...");
        thread::Builder::new()
            .name("stdin-quit".to_string())
            .spawn(move || {
                wait_for_enter(std::io::stdin().lock());
                let _ = quit_tx.send(());
            })
            .context("Failed to spawn input thread")?;
    }

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) || quit_rx.try_recv().is_ok()
        {
            break;
        }
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(event) => print_event(&event, json)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    monitor.stop();
    monitor.cleanup();

    let stats = monitor.stats();
    info!("Final counters: {stats:?}");
    if json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        eprintln!(
            "{} events emitted, {} duplicates, {} evicted, {} callback faults",
            stats.pipeline.emitted,
            stats.pipeline.duplicates,
            stats.bridge.evicted,
            stats.pipeline.callback_faults
        );
    }

    Ok(())
}

/// Block until a line (or end of input) arrives; false if reading failed
fn wait_for_enter(mut input: impl BufRead) -> bool {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to read from stdin, stopping: {e}");
            false
        }
    }
}

fn print_event(event: &ProcessEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{event}");
    }
    Ok(())
}

fn print_callback(kind: &str, event: &ProcessEvent, json: bool) {
    if json {
        let line = serde_json::json!({ "callback": kind, "event": event });
        println!("{line}");
    } else {
        println!(
            "[{kind} callback] {} (pid {})",
            event.process_name(),
            event.process_id()
        );
    }
}
