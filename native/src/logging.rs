//! Logger setup, the host crash log and optional Sentry reporting.
//!
//! Installer output is logged under its own target so it can be filtered separately, e.g.
//! `RUST_LOG=warn,installer=info`.

use chrono::SecondsFormat;
use log::{debug, error, info, warn, LevelFilter};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::panic::PanicHookInfo;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::config::APP_DIR;

pub const SENTRY_DSN_VAR: &str = "MOD_INSTALLER_SENTRY_DSN";
pub const INSTALLER_TARGET: &str = "installer";
pub const CRASH_LOG_FILE: &str = "host_crash.log";

static CRASH_LOG: Mutex<Option<PathBuf>> = Mutex::new(None);
static SENTRY: Mutex<Option<sentry::ClientInitGuard>> = Mutex::new(None);

fn guarded<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// env_logger at `default_level`, refined by `RUST_LOG` when set.
pub fn init_logger(default_level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.format(|buf, record| {
        let timestamp = buf.timestamp_millis();
        if record.target() == INSTALLER_TARGET {
            writeln!(
                buf,
                "{} {:<5} installer {}",
                timestamp,
                record.level(),
                record.args()
            )
        } else {
            writeln!(buf, "{} {:<5} {}", timestamp, record.level(), record.args())
        }
    });

    let _ = builder.try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of installer output: stdout at info, stderr at warn.
pub fn log_installer_output(pid: u32, stream: OutputStream, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }
    match stream {
        OutputStream::Stdout => info!(target: INSTALLER_TARGET, "[pid {}] {}", pid, line),
        OutputStream::Stderr => warn!(target: INSTALLER_TARGET, "[pid {}] {}", pid, line),
    }
}

/// Enable Sentry for `dsn`. Blank or missing DSNs keep it off.
pub fn init_sentry(dsn: Option<&str>, environment: Option<&str>) -> bool {
    let Some(dsn) = dsn.map(str::trim).filter(|dsn| !dsn.is_empty()) else {
        debug!("[SENTRY] Disabled, no DSN");
        return false;
    };

    let guard = sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: environment.map(|name| name.to_string().into()),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));
    if !guard.is_enabled() {
        warn!("[SENTRY] DSN rejected, reporting stays off");
        return false;
    }

    sentry::configure_scope(|scope| scope.set_tag("component", "mod-installer-host"));
    *guarded(&SENTRY) = Some(guard);
    info!("[SENTRY] Reporting enabled ({})", environment.unwrap_or("default"));
    true
}

pub fn init_sentry_from_env() -> bool {
    let dsn = std::env::var(SENTRY_DSN_VAR).ok();
    init_sentry(dsn.as_deref(), None)
}

pub fn is_sentry_enabled() -> bool {
    guarded(&SENTRY)
        .as_ref()
        .is_some_and(|guard| guard.is_enabled())
}

/// Flush queued events.
pub fn shutdown_sentry() {
    if let Some(guard) = guarded(&SENTRY).take() {
        debug!("[SENTRY] Flushing");
        drop(guard);
    }
}

/// A failure that ends an install outright: installer crash or lost transport.
pub fn capture_critical_error(context: &str, error: &str) {
    if is_sentry_enabled() {
        sentry::with_scope(
            |scope| {
                scope.set_tag("failure", context);
                scope.set_level(Some(sentry::Level::Fatal));
            },
            || sentry::capture_message(error, sentry::Level::Fatal),
        );
    }
    log_critical_error(context, error);
}

/// Append a critical error to the crash log without panicking.
pub fn log_critical_error(context: &str, error: &str) {
    let report = render_report(
        "critical error",
        &[("context", context.to_string()), ("error", error.to_string())],
    );
    if let Err(e) = append_crash_log(&report) {
        debug!("[CRASH LOG] Not written: {}", e);
    }
    error!("[{}] {}", context, error);
}

/// Route panics to `<local data>/ModInstallerHost/host_crash.log` and Sentry, then to the
/// previous hook.
pub fn init_crash_logger() -> PathBuf {
    let dir = dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("[CRASH LOG] Cannot create {}: {}", dir.display(), e);
    }
    let path = dir.join(CRASH_LOG_FILE);
    *guarded(&CRASH_LOG) = Some(path.clone());

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        let report = panic_report(panic);
        if is_sentry_enabled() {
            sentry::capture_message(&report, sentry::Level::Fatal);
        }
        if let Err(e) = append_crash_log(&report) {
            error!("[CRASH LOG] Not written: {}", e);
        }
        previous(panic);
    }));

    debug!("[CRASH LOG] {}", path.display());
    path
}

pub fn crash_log_path() -> Option<PathBuf> {
    guarded(&CRASH_LOG).clone()
}

fn panic_report(panic: &PanicHookInfo) -> String {
    let payload = panic.payload();
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    let location = panic
        .location()
        .map(|location| format!("{}:{}", location.file(), location.line()))
        .unwrap_or_else(|| "unknown".to_string());
    let thread = std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string();

    let mut report = render_report(
        "panic",
        &[
            ("location", location),
            ("message", message),
            ("thread", thread),
        ],
    );
    report.push_str(&format!("{}\n", std::backtrace::Backtrace::capture()));
    report
}

fn render_report(kind: &str, fields: &[(&str, String)]) -> String {
    let mut report = format!(
        "--- {} {} ---\n",
        kind,
        chrono::Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
    );
    for (label, value) in fields {
        report.push_str(&format!("{:>8}: {}\n", label, value));
    }
    report
}

fn append_crash_log(report: &str) -> io::Result<()> {
    let Some(path) = crash_log_path() else {
        return Ok(());
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", report)
}
