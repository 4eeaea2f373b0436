use std::process::{Command, Output};

use anyhow::{anyhow, Context, Result};
use clickspeak_observability::Tracer;
use serde_json::Value;

const STDERR_TAIL_CHARS: usize = 2000;

fn tail(s: &str, max_chars: usize) -> &str {
    let n = s.chars().count();
    if n <= max_chars {
        return s;
    }
    let skip = n - max_chars;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Runs `cmd` to completion; a non-zero exit is an `E_COMMAND_FAILED` error
/// carrying the tail of stderr.
pub fn run_checked(cmd: &mut Command, what: &str) -> Result<Output> {
    let out = cmd
        .output()
        .with_context(|| format!("spawn {what} failed: {:?}", cmd.get_program()))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(anyhow!(
            "E_COMMAND_FAILED: {what} exited with {}: {}",
            out.status,
            tail(stderr.trim(), STDERR_TAIL_CHARS)
        ));
    }
    Ok(out)
}

/// Like [`run_checked`] but lets the child write straight to the terminal.
pub fn run_inherited(cmd: &mut Command, what: &str) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("spawn {what} failed: {:?}", cmd.get_program()))?;
    if !status.success() {
        return Err(anyhow!("E_COMMAND_FAILED: {what} exited with {status}"));
    }
    Ok(())
}

/// Runs `f` inside a span named `step`; failures are recorded under `code`.
pub fn traced<T>(
    tracer: &Tracer,
    step: &str,
    code: &str,
    ctx: Option<Value>,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let span = tracer.span(step, ctx);
    match f() {
        Ok(v) => {
            span.ok(None);
            Ok(v)
        }
        Err(e) => {
            span.err_anyhow("process", code, &e, None);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("héllo", 4), "éllo");
    }

    #[cfg(unix)]
    #[test]
    fn failure_carries_stderr() {
        let err = run_checked(
            Command::new("/bin/sh").args(["-c", "echo nope >&2; exit 3"]),
            "probe",
        )
        .unwrap_err();
        let s = err.to_string();
        assert!(s.starts_with("E_COMMAND_FAILED: probe exited with"), "{s}");
        assert!(s.ends_with("nope"), "{s}");
    }

    #[cfg(unix)]
    #[test]
    fn success_returns_output() {
        let out = run_checked(Command::new("/bin/sh").args(["-c", "echo hi"]), "echo")
            .expect("run");
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hi");
    }
}
