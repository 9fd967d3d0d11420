/// Structured logging for the training pipeline
///
/// Provides stage-tagged logging with site/variable identifiers on top of
/// `tracing`. Supports console output and an optional append-only log
/// file for long unattended training runs.

use serde::Deserialize;
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt as tracing_fmt};

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Catalog,
    Join,
    Partition,
    Train,
    Artifact,
    Verify,
    System,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Catalog => write!(f, "CATALOG"),
            Stage::Join => write!(f, "JOIN"),
            Stage::Partition => write!(f, "PARTITION"),
            Stage::Train => write!(f, "TRAIN"),
            Stage::Artifact => write!(f, "ARTIFACT"),
            Stage::Verify => write!(f, "VERIFY"),
            Stage::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Broken input - unreadable file, bad table layout or absent site
    Unexpected,
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber Setup
// ---------------------------------------------------------------------------

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `min_level` when set. Calling this more than once
/// (e.g. from several tests) is harmless; later calls are ignored.
pub fn init_logger(min_level: LogLevel, log_file: Option<&Path>, console_timestamps: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(min_level).into())
        .from_env_lossy();

    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    let console_layer = if console_timestamps {
        tracing_fmt::layer().with_target(false).boxed()
    } else {
        tracing_fmt::layer().with_target(false).without_time().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Log a general informational message
pub fn info(stage: Stage, id: Option<&str>, message: &str) {
    tracing::info!(stage = %stage, id = id.unwrap_or("-"), "{}", message);
}

/// Log a warning message
pub fn warn(stage: Stage, id: Option<&str>, message: &str) {
    tracing::warn!(stage = %stage, id = id.unwrap_or("-"), "{}", message);
}

/// Log an error message
pub fn error(stage: Stage, id: Option<&str>, message: &str) {
    tracing::error!(stage = %stage, id = id.unwrap_or("-"), "{}", message);
}

/// Log a debug message
pub fn debug(stage: Stage, id: Option<&str>, message: &str) {
    tracing::debug!(stage = %stage, id = id.unwrap_or("-"), "{}", message);
}

// ---------------------------------------------------------------------------
// Failure Logging
// ---------------------------------------------------------------------------

/// Classify a join-stage failure from its message.
pub fn classify_join_failure(error_message: &str) -> FailureType {
    if error_message.contains("unreadable") || error_message.contains("not present") {
        FailureType::Unexpected
    } else {
        FailureType::Unknown
    }
}

/// Log a join failure for a site or variable with automatic classification
pub fn log_join_failure(id: &str, operation: &str, err: &dyn std::error::Error) {
    let error_msg = err.to_string();
    let failure_type = classify_join_failure(&error_msg);

    let message = format!("{} failed [{}]: {}", operation, failure_type, error_msg);

    match failure_type {
        FailureType::Unexpected => error(Stage::Join, Some(id), &message),
        FailureType::Unknown => warn(Stage::Join, Some(id), &message),
    }
}

// ---------------------------------------------------------------------------
// Join Summary Logging
// ---------------------------------------------------------------------------

/// Log how many sites contributed rows to the corpus
pub fn log_join_summary(total_sites: usize, contributing: usize, rows: usize) {
    let empty = total_sites - contributing.min(total_sites);
    let message = format!(
        "Join complete: {}/{} sites contributed {} rows, {} empty",
        contributing, total_sites, rows, empty
    );

    if empty == 0 {
        info(Stage::Join, None, &message);
    } else if contributing == 0 {
        error(Stage::Join, None, &message);
    } else {
        warn(Stage::Join, None, &message);
    }
}
