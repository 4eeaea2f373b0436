use std::{path::PathBuf, process::Command};

use anyhow::{anyhow, Context, Result};

pub const DIALOG_TITLE: &str = "ClickSpeak Error";

/// Something that can put a blocking message in front of the user.
///
/// Returns once the user has dismissed it (or it could not be shown).
pub trait UserNotifier {
    fn notify(&self, message: &str) -> Result<()>;
}

impl<T: UserNotifier + ?Sized> UserNotifier for &T {
    fn notify(&self, message: &str) -> Result<()> {
        (**self).notify(message)
    }
}

/// Makes `s` safe inside an AppleScript string literal.
pub fn escape_applescript(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' | '\r' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

pub fn dialog_script(title: &str, message: &str) -> String {
    format!(
        "display dialog \"{}\" with title \"{}\" buttons {{\"OK\"}} default button \"OK\" with icon stop",
        escape_applescript(message),
        escape_applescript(title)
    )
}

/// Modal dialog via `osascript`; the launcher waits for it to close.
#[derive(Debug, Clone)]
pub struct DialogNotifier {
    program: PathBuf,
    title: String,
}

impl Default for DialogNotifier {
    fn default() -> Self {
        Self {
            program: PathBuf::from("osascript"),
            title: DIALOG_TITLE.to_string(),
        }
    }
}

impl DialogNotifier {
    /// Runs `program -e <script>` instead of `osascript`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }
}

impl UserNotifier for DialogNotifier {
    fn notify(&self, message: &str) -> Result<()> {
        let script = dialog_script(&self.title, message);
        let status = Command::new(&self.program)
            .arg("-e")
            .arg(&script)
            .status()
            .with_context(|| format!("spawn {} failed", self.program.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "E_DIALOG_FAILED: {} exited with {status}",
                self.program.display()
            ));
        }
        Ok(())
    }
}
