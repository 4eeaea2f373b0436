use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_TRACE_MAX_BYTES: u64 = 5_000_000; // 5MB
const DEFAULT_TRACE_MAX_FILES: usize = 3;
const DEFAULT_BACKTRACE_MAX_CHARS: usize = 8_000;

pub const TRACE_FILE: &str = "trace.jsonl";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn env_bool_default_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            !(t == "0" || t == "false" || t == "no" || t == "off")
        }
        Err(_) => true,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(v) => v.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// `CLICKSPEAK_TRACE_ENABLED=0` turns tracing off.
pub fn enabled() -> bool {
    env_bool_default_true("CLICKSPEAK_TRACE_ENABLED")
}

fn backtrace_enabled() -> bool {
    env_bool_default_true("CLICKSPEAK_TRACE_BACKTRACE")
}

pub fn trace_path(dir: &Path) -> PathBuf {
    dir.join(TRACE_FILE)
}

fn rotate_if_needed_best_effort(dir: &Path, max_bytes: u64, max_files: usize) {
    if max_files == 0 {
        return;
    }
    let p = trace_path(dir);
    let len = match std::fs::metadata(&p) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if len <= max_bytes {
        return;
    }

    let oldest = dir.join(format!("{TRACE_FILE}.{max_files}"));
    if oldest.exists() {
        let _ = std::fs::remove_file(&oldest);
    }
    for i in (1..max_files).rev() {
        let src = dir.join(format!("{TRACE_FILE}.{i}"));
        let dst = dir.join(format!("{TRACE_FILE}.{}", i + 1));
        if src.exists() {
            let _ = std::fs::rename(&src, &dst);
        }
    }
    let _ = std::fs::rename(&p, dir.join(format!("{TRACE_FILE}.1")));
}

fn trace_write_lock() -> &'static Mutex<()> {
    static TRACE_WRITE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    TRACE_WRITE_LOCK.get_or_init(|| Mutex::new(()))
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

/// Scrubs the user name out of home-directory paths.
fn redact_user_paths(s: &str) -> String {
    fn scrub_after(hay: &str, marker: &str) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut i = 0;
        while let Some(pos) = hay[i..].find(marker) {
            let abs = i + pos;
            out.push_str(&hay[i..abs]);
            out.push_str(marker);
            let rest = &hay[abs + marker.len()..];
            let name_len = rest.find('/').unwrap_or(rest.len());
            out.push_str("<redacted>");
            i = abs + marker.len() + name_len;
        }
        out.push_str(&hay[i..]);
        out
    }

    let t = scrub_after(s, "/Users/");
    scrub_after(&t, "/home/")
}

fn maybe_backtrace_string() -> Option<String> {
    if !backtrace_enabled() {
        return None;
    }
    let bt = std::backtrace::Backtrace::force_capture();
    Some(clamp_chars(
        &redact_user_paths(&format!("{bt:?}")),
        DEFAULT_BACKTRACE_MAX_CHARS,
    ))
}

fn merge_ctx(base: serde_json::Map<String, Value>, extra: Option<Value>) -> Value {
    match extra {
        None => Value::Object(base),
        Some(Value::Object(m)) => {
            let mut out = base;
            out.extend(m);
            Value::Object(out)
        }
        Some(v) => {
            let mut out = base;
            out.insert("extra".to_string(), v);
            Value::Object(out)
        }
    }
}

fn ctx_with_backtrace(extra: Option<Value>) -> Option<Value> {
    let Some(bt) = maybe_backtrace_string() else {
        return extra;
    };
    let mut m = serde_json::Map::new();
    m.insert("backtrace".to_string(), Value::String(bt));
    Some(merge_ctx(m, extra))
}

fn ctx_for_anyhow_error(err: &AnyhowError, extra: Option<Value>) -> Value {
    let mut m = serde_json::Map::new();
    let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
    m.insert("err_chain".to_string(), serde_json::json!(chain));
    merge_ctx(m, extra)
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,    // io|process|config|runtime|logic
    pub code: String,    // E_*
    pub message: String, // short
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub run_id: String,
    pub component: String,
    pub step: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

/// Appends events for one process run to `<dir>/trace.jsonl`.
///
/// A tracer without a directory (no home dir yet, or tracing disabled) accepts
/// every call and writes nothing, so callers never branch on it.
#[derive(Debug, Clone)]
pub struct Tracer {
    dir: Option<PathBuf>,
    run_id: String,
    component: String,
    max_bytes: u64,
    max_files: usize,
}

impl Tracer {
    pub fn new(dir: impl Into<PathBuf>, component: &str) -> Self {
        let dir = enabled().then(|| dir.into());
        Self {
            dir,
            run_id: format!("{}-{}", std::process::id(), now_ms()),
            component: component.to_string(),
            max_bytes: env_u64("CLICKSPEAK_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES),
            max_files: env_usize("CLICKSPEAK_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES),
        }
    }

    pub fn disabled(component: &str) -> Self {
        Self {
            dir: None,
            run_id: format!("{}-{}", std::process::id(), now_ms()),
            component: component.to_string(),
            max_bytes: DEFAULT_TRACE_MAX_BYTES,
            max_files: DEFAULT_TRACE_MAX_FILES,
        }
    }

    pub fn with_rotation(mut self, max_bytes: u64, max_files: usize) -> Self {
        self.max_bytes = max_bytes;
        self.max_files = max_files;
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn emit_best_effort(&self, ev: &TraceEvent) {
        let Some(dir) = self.dir.as_deref() else {
            return;
        };
        let _guard = trace_write_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = std::fs::create_dir_all(dir);
        rotate_if_needed_best_effort(dir, self.max_bytes, self.max_files);

        let p = trace_path(dir);
        let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
            Ok(f) => f,
            Err(e) => {
                crate::safe_eprintln!("trace: open failed: {}: {e}", p.display());
                return;
            }
        };
        let mut line = match serde_json::to_string(ev) {
            Ok(s) => s,
            Err(e) => {
                crate::safe_eprintln!("trace: serialize failed: {e}");
                return;
            }
        };
        line.push('\n');
        if let Err(e) = f.write_all(line.as_bytes()) {
            crate::safe_eprintln!("trace: write failed: {e}");
        }
    }

    fn record(
        &self,
        step: &str,
        op: &str,
        status: &str,
        duration_ms: Option<u128>,
        error: Option<TraceError>,
        ctx: Option<Value>,
    ) {
        if self.dir.is_none() {
            return;
        }
        self.emit_best_effort(&TraceEvent {
            ts_ms: now_ms(),
            run_id: self.run_id.clone(),
            component: self.component.clone(),
            step: step.to_string(),
            op: op.to_string(),
            status: status.to_string(),
            duration_ms,
            error,
            ctx,
        });
    }

    pub fn event(&self, step: &str, status: &str, ctx: Option<Value>) {
        self.record(step, "event", status, None, None, ctx);
    }

    pub fn span(&self, step: &str, ctx: Option<Value>) -> Span {
        self.record(step, "start", "ok", None, None, ctx);
        Span {
            tracer: self.clone(),
            step: step.to_string(),
            t0: Instant::now(),
            finished: false,
        }
    }
}

pub struct Span {
    tracer: Tracer,
    step: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    fn end(&mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        self.tracer.record(
            &self.step,
            "end",
            status,
            Some(self.t0.elapsed().as_millis()),
            error,
            ctx,
        );
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.end("ok", None, ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        let ctx = if self.tracer.dir.is_some() {
            ctx_with_backtrace(ctx)
        } else {
            ctx
        };
        self.end("err", Some(error), ctx);
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        self.end("err", Some(error), Some(ctx_for_anyhow_error(err, ctx)));
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        self.end("aborted", Some(error), None);
    }
}
