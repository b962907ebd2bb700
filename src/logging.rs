//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `APPMAN_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`
//!
//! The terminal belongs to the TUI, so events are written into the merged
//! log feed under the `appman` label instead of stderr.

use anyhow::{anyhow, Result};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

use crate::output::{LogFeed, OutputSink, StreamKind};

pub const LOG_LABEL: &str = "appman";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Hands out one feed sink per formatted event.
#[derive(Clone)]
pub struct FeedWriter {
    feed: LogFeed,
}

impl FeedWriter {
    pub fn new(feed: LogFeed) -> Self {
        Self { feed }
    }
}

impl<'a> MakeWriter<'a> for FeedWriter {
    type Writer = OutputSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.feed.sink(LOG_LABEL, StreamKind::Stdout)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        let stream = if *meta.level() <= Level::WARN {
            StreamKind::Stderr
        } else {
            StreamKind::Stdout
        };
        self.feed.sink(LOG_LABEL, stream)
    }
}

/// Initialise the global logging subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, feed: &LogFeed) -> Result<()> {
    let level = resolve_level(cli_level, std::env::var("APPMAN_LOG").ok().as_deref());
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_ansi(false)
        .with_writer(FeedWriter::new(feed.clone()))
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {}", err))
}

fn resolve_level(cli_level: Option<LogLevel>, env_level: Option<&str>) -> Level {
    match cli_level {
        Some(lvl) => level_from_log_level(lvl),
        None => env_level.and_then(parse_level_str).unwrap_or(Level::INFO),
    }
}

fn level_from_log_level(lvl: LogLevel) -> Level {
    match lvl {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
