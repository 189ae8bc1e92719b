use std::{
    backtrace::Backtrace,
    fs::OpenOptions,
    io::Write,
    panic::{take_hook, PanicHookInfo},
    path::{Path, PathBuf},
    thread,
};

use chrono::Local;

use crate::logging::LOG_FILE_PREFIX;

/// Installs a global panic hook that logs panics via `tracing` and also
/// appends a panic record to the current daily log file in `log_dir`.
///
/// The duplication is deliberate: `tracing` covers normal logging, while the
/// direct file append preserves panic details in `panic = "abort"` builds
/// where the background log writer may not flush before the abort.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = format_panic_record(panic_info);

            tracing::error!(target: "golive::panic", "{record}");

            // Matches the `tracing_appender::rolling::daily` naming, so the
            // record lands next to the rest of that day's log output.
            if cfg!(panic = "abort") {
                let _ = append_panic_record(&log_dir, &record);
            }
        }));

        // Preserve the default hook output/backtrace behavior.
        previous_hook(panic_info);
    }));
}

fn append_panic_record(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let filename = format!("{LOG_FILE_PREFIX}.{}", Local::now().format("%Y-%m-%d"));
    let path = PathBuf::from(log_dir).join(filename);

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

fn format_panic_record(panic_info: &PanicHookInfo<'_>) -> String {
    let payload = panic_info
        .payload_as_str()
        .map(str::to_string)
        .unwrap_or_else(|| panic_info.to_string());

    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "<unknown>".to_string());

    let thread_name = thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "<unnamed>".to_string());

    let backtrace = Backtrace::force_capture();
    let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");

    format!(
        "{ts} PANIC thread={thread_name} location={location} payload={payload}\nBacktrace:\n{backtrace}"
    )
}
