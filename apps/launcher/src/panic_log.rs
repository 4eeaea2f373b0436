use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

pub const PANIC_LOG_FILE: &str = "panic.log";

pub fn panic_log_path(dir: &Path) -> PathBuf {
    dir.join(PANIC_LOG_FILE)
}

fn append_best_effort(dir: &Path, entry: &str) {
    let _ = std::fs::create_dir_all(dir);
    let path = panic_log_path(dir);
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = f.write_all(entry.as_bytes());
    }
}

fn format_entry(info: &dyn std::fmt::Display, backtrace: &dyn std::fmt::Display) -> String {
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    format!("ts_ms={ts_ms}\npanic={info}\nbacktrace={backtrace}\n---\n")
}

// A Finder launch has no terminal, and the default hook writes to stderr.
// Panics are appended to `panic.log` under `dir` instead; the hook itself
// never panics.
pub fn install_best_effort(dir: Option<PathBuf>) {
    std::panic::set_hook(Box::new(move |info| {
        let bt = std::backtrace::Backtrace::force_capture();
        let entry = format_entry(info, &bt);
        match dir.as_deref() {
            Some(d) => append_best_effort(d, &entry),
            None => clickspeak_observability::safe_eprintln!("{entry}"),
        }
    }));
}
