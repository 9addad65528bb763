//! Log filter selection, the rolling log file sink, and the crash-artifact
//! panic hook. The harness crate owns the subscriber; this module only
//! decides the directives and provides the writers.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Prepended to implicit filter choices; ORT logs per-run provider chatter
/// at warn level that drowns the stage's own output.
pub const ORT_NOISE_SUPPRESSION: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_FILE_PREFIX: &str = "tempra";
pub const LOG_FILE_SUFFIX: &str = "log";

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_GUARD: AtomicBool = AtomicBool::new(false);
static ARTIFACT_SERIAL: AtomicU64 = AtomicU64::new(0);

/// A selected set of tracing directives and how it was selected. Implicit
/// choices (defaults, `RUST_LOG`) get the ORT noise suppression prepended;
/// a filter the operator spelled out is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChoice {
    pub directives: String,
    pub explicit: bool,
}

impl FilterChoice {
    pub fn effective(&self) -> String {
        if self.explicit {
            self.directives.clone()
        } else {
            format!("{ORT_NOISE_SUPPRESSION},{}", self.directives)
        }
    }
}

/// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the
/// built-in default.
pub fn resolve_log_filter(
    cli_filter: Option<&str>,
    verbose: u8,
    rust_log: Option<&str>,
) -> FilterChoice {
    if let Some(directives) = cli_filter {
        return FilterChoice {
            directives: directives.to_string(),
            explicit: true,
        };
    }
    match verbose {
        0 => FilterChoice {
            directives: rust_log.unwrap_or(DEFAULT_LOG_FILTER).to_string(),
            explicit: false,
        },
        1 => FilterChoice {
            directives: "debug".to_string(),
            explicit: true,
        },
        _ => FilterChoice {
            directives: "trace".to_string(),
            explicit: true,
        },
    }
}

pub struct LogFileSink {
    pub dir: PathBuf,
    pub retention_files: usize,
    pub writer: RollingFileAppender,
}

/// Opens the daily-rotated log file under `<data_dir>/logs`. A retention of
/// zero means the default. The caller decides what to do on failure; the
/// stage itself runs fine without a file sink.
pub fn open_log_file_sink(data_dir: &Path, retention_files: usize) -> Result<LogFileSink> {
    let retention = if retention_files == 0 {
        DEFAULT_LOG_RETENTION
    } else {
        retention_files
    };
    let dir = data_dir.join(LOG_DIR_NAME);
    fs::create_dir_all(&dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    let writer = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&dir)
        .with_context(|| format!("open rolling log file in {}", dir.display()))?;
    Ok(LogFileSink {
        dir,
        retention_files: retention,
        writer,
    })
}

/// Installs a panic hook that writes one crash artifact per panic under
/// `<data_dir>/logs/crash`, then chains to the previous hook. Process-global
/// and installed once: later calls return the directory already in effect.
pub fn install_crash_hook(data_dir: &Path) -> Result<PathBuf> {
    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    fs::create_dir_all(&crash_dir)
        .with_context(|| format!("create crash artifact directory {}", crash_dir.display()))?;

    let active_dir = CRASH_DIR.get_or_init(|| {
        let hook_dir = crash_dir.clone();
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            record_crash(&hook_dir, info);
            previous(info);
        }));
        crash_dir.clone()
    });
    Ok(active_dir.clone())
}

/// Runs inside the panic hook: must never unwind or recurse, and degrades
/// to a stderr warning when the artifact cannot be written.
fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if CRASH_WRITE_GUARD.swap(true, Ordering::AcqRel) {
        return;
    }
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_artifact(crash_dir, info)
    }));
    match outcome {
        Ok(Ok(_path)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash artifact writer failed under '{}'; artifact abandoned.",
            crash_dir.display()
        ),
    }
    CRASH_WRITE_GUARD.store(false, Ordering::Release);
}

fn write_crash_artifact(crash_dir: &Path, info: &PanicHookInfo<'_>) -> std::io::Result<PathBuf> {
    let location = info
        .location()
        .map(|at| format!("{}:{}:{}", at.file(), at.line(), at.column()))
        .unwrap_or_else(|| "<unknown>".to_string());
    let body = crash_artifact_body(&location, &payload_text(info.payload()));
    persist_crash_artifact(crash_dir, &body)
}

fn crash_artifact_body(location: &str, payload: &str) -> String {
    let (policy, trace) = describe_backtrace();
    format!(
        "timestamp_utc={}\nthread={}\nlocation={location}\npayload={payload}\nbacktrace_policy={policy}\nbacktrace:\n{trace}\n",
        chrono::Utc::now().to_rfc3339(),
        thread::current().name().unwrap_or("<unnamed>"),
    )
}

fn persist_crash_artifact(crash_dir: &Path, body: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;
    let serial = ARTIFACT_SERIAL.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{serial:06}.{LOG_FILE_SUFFIX}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S-%f")
    ));
    fs::write(&path, body)?;
    Ok(path)
}

fn describe_backtrace() -> (&'static str, String) {
    let trace = Backtrace::capture();
    match trace.status() {
        BacktraceStatus::Captured => ("captured", trace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1 to capture)",
            "<disabled>".to_string(),
        ),
        _ => (
            "unavailable",
            "<backtrace unavailable on this platform>".to_string(),
        ),
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
