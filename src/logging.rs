// src/logging.rs

//! Logging setup for `exprun` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the console log level:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `EXPRUN_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`
//!
//! Two audiences are served:
//! - the console (stderr), which receives the externally phrased messages;
//! - one log file per test replica (`logs/<replica>.log`), which receives
//!   everything emitted while that replica's [`UnitLogger::scope`] is active,
//!   including the detailed internal phrasing targeted at [`DETAIL_TARGET`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{Instrument, Span};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;

use crate::cli::LogLevel;

/// Target for messages meant only for the per-replica log file.
pub const DETAIL_TARGET: &str = "exprun::detail";

tokio::task_local! {
    static CURRENT_UNIT: Option<Arc<str>>;
}

/// Initialise the global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, logs_dir: impl Into<PathBuf>) -> Result<()> {
    let level = match cli_level {
        Some(lvl) => level_from_log_level(lvl),
        None => std::env::var("EXPRUN_LOG")
            .ok()
            .and_then(|s| parse_level_str(&s))
            .unwrap_or(tracing::Level::INFO),
    };
    let console_max = LevelFilter::from_level(level);

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(io::stderr)
        .with_filter(filter_fn(move |meta| {
            meta.target() != DETAIL_TARGET && *meta.level() <= console_max
        }));

    let unit_files = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(UnitFileWriter::new(logs_dir))
        .with_filter(filter_fn(|meta| {
            meta.is_span() || (in_unit_scope() && *meta.level() <= LevelFilter::DEBUG)
        }));

    tracing_subscriber::registry()
        .with(console)
        .with(unit_files)
        .try_init()?;

    Ok(())
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

fn in_unit_scope() -> bool {
    CURRENT_UNIT
        .try_with(|unit| unit.is_some())
        .unwrap_or(false)
}

/// Per-replica logging handle.
///
/// Cloned into every component acting on behalf of a replica (retry cursors,
/// the provisioner while it is leased, the lifecycle). The global handle has
/// no unit and therefore cannot split audiences: everything goes to the
/// console.
#[derive(Debug, Clone)]
pub struct UnitLogger {
    unit: Option<Arc<str>>,
    span: Span,
}

impl UnitLogger {
    pub fn global() -> Self {
        Self {
            unit: None,
            span: Span::none(),
        }
    }

    pub fn for_unit(id: &str) -> Self {
        Self {
            unit: Some(Arc::from(id)),
            span: tracing::info_span!("unit", test = %id),
        }
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Whether internal and external phrasings reach different sinks.
    pub fn splits_audiences(&self) -> bool {
        self.unit.is_some()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `fut` with this logger's unit file and span active.
    pub fn scope<F>(&self, fut: F) -> impl Future<Output = F::Output> + use<F>
    where
        F: Future,
    {
        CURRENT_UNIT.scope(self.unit.clone(), fut.instrument(self.span.clone()))
    }
}

/// `MakeWriter` routing each event to the log file of the unit in scope.
#[derive(Debug, Clone)]
struct UnitFileWriter {
    dir: PathBuf,
    files: Arc<Mutex<HashMap<Arc<str>, Arc<Mutex<File>>>>>,
}

impl UnitFileWriter {
    fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn file_for(&self, unit: &Arc<str>) -> Option<Arc<Mutex<File>>> {
        let mut files = self.files.lock().ok()?;
        if let Some(file) = files.get(unit) {
            return Some(Arc::clone(file));
        }

        fs::create_dir_all(&self.dir).ok()?;
        let path = self.dir.join(format!("{unit}.log"));
        let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
        let file = Arc::new(Mutex::new(file));
        files.insert(Arc::clone(unit), Arc::clone(&file));
        Some(file)
    }
}

impl<'a> MakeWriter<'a> for UnitFileWriter {
    type Writer = UnitWriter;

    fn make_writer(&'a self) -> Self::Writer {
        let unit = CURRENT_UNIT.try_with(|unit| unit.clone()).ok().flatten();
        match unit.and_then(|unit| self.file_for(&unit)) {
            Some(file) => UnitWriter::File(file),
            None => UnitWriter::Discard,
        }
    }
}

enum UnitWriter {
    File(Arc<Mutex<File>>),
    Discard,
}

impl Write for UnitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            UnitWriter::File(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| io::Error::other("unit log file lock poisoned"))?;
                file.write_all(buf)?;
                Ok(buf.len())
            }
            UnitWriter::Discard => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            UnitWriter::File(file) => file
                .lock()
                .map_err(|_| io::Error::other("unit log file lock poisoned"))?
                .flush(),
            UnitWriter::Discard => Ok(()),
        }
    }
}
