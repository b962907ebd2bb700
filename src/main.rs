//! appman: a local process supervisor with a TUI.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, builds the registry of managed applications and runs the
//! event loop that ties operator input, the liveness poller and shutdown together.

mod app;
mod config;
mod errors;
mod events;
mod logging;
mod output;
mod poller;
mod process;
mod registry;
mod runner;
mod tui;

use std::fs::OpenOptions;
use std::io::LineWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::{App, AppAction};
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::events::Event;
use crate::logging::LogLevel;
use crate::output::LogFeed;
use crate::poller::{LivenessPoller, SysinfoTable};
use crate::registry::Registry;
use crate::runner::Supervisor;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_LINES: usize = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 3000;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "appman",
    version,
    about = "Start, stop and watch local applications from one terminal",
    styles = help_styles(),
    color = clap::ColorChoice::Always
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Interval between liveness checks (ms). Overrides the config file.
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Log level for supervisor diagnostics. Falls back to APPMAN_LOG.
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

/// Effective settings after merging CLI flags over the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RunSettings {
    poll_interval: Duration,
    max_lines: usize,
    shutdown_timeout: Duration,
    log_file: Option<PathBuf>,
}

impl RunSettings {
    fn resolve(cli: &Cli, config: &Config) -> Self {
        let poll_interval_ms = cli
            .poll_interval_ms
            .or(config.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(1);
        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_lines: config.max_lines.unwrap_or(DEFAULT_MAX_LINES),
            shutdown_timeout: Duration::from_millis(
                config
                    .shutdown_timeout_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            ),
            log_file: config.log_file.as_ref().map(PathBuf::from),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    let settings = RunSettings::resolve(&cli, &config);

    let feed = LogFeed::new(settings.max_lines);
    if let Some(path) = &settings.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        feed.set_mirror(LineWriter::new(file));
    }
    logging::init_logging(cli.log_level, &feed)?;

    let (registry, errors) = Registry::build(&config.apps, &feed);
    if registry.is_empty() {
        if errors.is_empty() {
            bail!("no applications defined in {}", cli.config.display());
        }
        let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
        bail!(
            "no valid applications in {}: {}",
            cli.config.display(),
            reasons.join("; ")
        );
    }
    info!(
        config = %cli.config.display(),
        apps = registry.len(),
        skipped = errors.len(),
        "configuration loaded"
    );

    let registry = Arc::new(registry);
    let supervisor = Supervisor::new(Arc::clone(&registry));
    let mut app = App::new(Arc::clone(&registry), feed.clone());
    if !errors.is_empty() {
        app.set_status_warning(format!("{} invalid application(s) skipped", errors.len()));
    }

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let poller = LivenessPoller::new(Arc::clone(&registry), SysinfoTable::new())
        .spawn(settings.poll_interval, event_tx.clone());

    let mut terminal = tui::init_terminal().context("failed to initialise terminal")?;
    spawn_input_listener(event_tx.clone());
    spawn_signal_listener(event_tx.clone());

    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());
    let mut last_frame = None;

    loop {
        let mut redraw = false;
        tokio::select! {
            Some(event) = event_rx.recv() => {
                redraw = true;
                match event {
                    Event::ProcessLost { id, pid } => {
                        let name = registry
                            .get(id)
                            .map(|process| process.name().to_string())
                            .unwrap_or_else(|| "process".to_string());
                        app.set_status_warning(format!("{} (pid {}) is no longer running", name, pid));
                    }
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, &supervisor);
                    }
                    Event::Resize { width, height } => {
                        debug!(width, height, "terminal resized");
                        if let Err(err) = terminal.autoresize() {
                            warn!(error = %err, "terminal resize failed");
                        }
                    }
                    Event::Shutdown => {
                        info!("termination signal received");
                        app.should_quit = true;
                    }
                }
            }
            _ = ticker.tick() => {}
        }

        if app.should_quit {
            app.set_status_warning_persistent("shutting down");
        }
        let stamp = app.frame_stamp();
        if redraw || last_frame.as_ref() != Some(&stamp) {
            if let Err(err) = tui::draw(&mut app, &mut terminal) {
                result = Err(err.into());
                break;
            }
            last_frame = Some(stamp);
        }
        if app.should_quit {
            break;
        }
    }

    supervisor.shutdown_all(settings.shutdown_timeout).await;
    poller.abort();
    tui::restore_terminal(terminal).context("failed to restore terminal")?;
    result
}

fn handle_app_action(action: AppAction, app: &mut App, supervisor: &Supervisor) {
    match action {
        AppAction::None => {}
        AppAction::Quit => {
            app.should_quit = true;
        }
        AppAction::Start(id) => match supervisor.start(id) {
            Ok(view) => app.set_status_message(format!(
                "Launched {} (pid {})",
                view.name,
                view.pid.unwrap_or(0)
            )),
            Err(err) => {
                warn!(error = %err, "launch failed");
                app.set_status_warning(err.to_string());
            }
        },
        AppAction::Stop(id) => match supervisor.stop(id) {
            Ok(view) => app.set_status_message(format!("Shut down {}", view.name)),
            Err(err) => {
                warn!(error = %err, "shutdown failed");
                app.set_status_warning(err.to_string());
            }
        },
    }
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key))
                    if key.kind == crossterm::event::KeyEventKind::Press =>
                {
                    Event::Key(key)
                }
                Ok(crossterm::event::Event::Resize(width, height)) => {
                    Event::Resize { width, height }
                }
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(Event::Shutdown).await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            let _ = tx.send(Event::Shutdown).await;
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Event::Shutdown).await;
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}
