use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "inkscale";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Per-image dispatch and session lifecycle events; always kept in log files.
const FILE_DEBUG_TARGETS: [&str; 1] = ["inkscale_core::upscale"];

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug)]
struct PanicArtifactRecord {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    source_location: String,
    payload: String,
    backtrace_policy: String,
    backtrace_text: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready(plan) => Some(&plan.log_dir),
            Self::Fallback(plan) => plan.attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Install a panic hook that writes a crash report under
/// `<data_dir>/logs/crash/` before chaining to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(existing_crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing_crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing_crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing_crash_dir.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let crash_dir_for_hook = crash_dir.clone();
    panic::set_hook(Box::new(move |panic_info| {
        write_panic_artifact_with_fallback(&crash_dir_for_hook, panic_info);
        previous_hook(panic_info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match appender {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

/// Filter precedence: `--log-filter` > `-v`/`-vv` > `RUST_LOG` > default.
/// The noise filter is only prepended when nothing was chosen explicitly.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    let implicit = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;
    let noise = options.noise_filter.trim();

    let console_filter = if implicit && !noise.is_empty() {
        format!("{noise},{user_filter}")
    } else {
        user_filter.clone()
    };
    let file_filter = if implicit {
        let mut directives: Vec<String> = noise
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        for target in FILE_DEBUG_TARGETS {
            if !directives.iter().any(|d| d.starts_with(&format!("{target}="))) {
                directives.push(format!("{target}=debug"));
            }
        }
        directives.push(user_filter.clone());
        directives.join(",")
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn write_panic_artifact_with_fallback(crash_dir: &Path, panic_info: &PanicHookInfo<'_>) {
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let write_result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let report = build_panic_artifact_record(panic_info);
        write_panic_artifact_file(crash_dir, &report)
    }));

    match write_result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn build_panic_artifact_record(panic_info: &PanicHookInfo<'_>) -> PanicArtifactRecord {
    let (backtrace_policy, backtrace_text) = capture_backtrace_details();

    let source_location = panic_info
        .location()
        .map(|location| {
            format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )
        })
        .unwrap_or_else(|| "<unknown>".to_string());

    PanicArtifactRecord {
        timestamp: chrono::Utc::now(),
        thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
        source_location,
        payload: panic_payload_to_string(panic_info.payload()),
        backtrace_policy,
        backtrace_text,
    }
}

fn capture_backtrace_details() -> (String, String) {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => ("captured".to_string(), backtrace.to_string()),
        BacktraceStatus::Disabled => (
            "disabled (set RUST_BACKTRACE=1/full to enable)".to_string(),
            "<disabled by backtrace policy>".to_string(),
        ),
        _ => (
            "unsupported".to_string(),
            "<backtrace unavailable>".to_string(),
        ),
    }
}

fn write_panic_artifact_file(
    crash_dir: &Path,
    report: &PanicArtifactRecord,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let filename = format!(
        "{DEFAULT_LOG_FILE_PREFIX}-panic-{}-{sequence:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    );
    let artifact_path = crash_dir.join(filename);

    let mut file = fs::File::create(&artifact_path)?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread_name)?;
    writeln!(file, "location={}", report.source_location)?;
    writeln!(file, "payload={}", report.payload)?;
    writeln!(file, "backtrace_policy={}", report.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", report.backtrace_text)?;
    file.flush()?;

    Ok(artifact_path)
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
