//! Pollable stdout/stderr buffers for worker console output.
//!
//! Output survives failed commands: the loop appends regardless of command
//! outcome and callers drain at their leisure. Lines are also mirrored to the
//! `pylet::console` tracing target so diagnostics show up in host logs.

use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct Console {
    stdout: Mutex<String>,
    stderr: Mutex<String>,
}

impl Console {
    pub fn push_stdout(&self, text: &str) {
        for line in text.lines() {
            if !line.is_empty() {
                tracing::info!(target: "pylet::console", stream = "stdout", "{}", line);
            }
        }
        lock(&self.stdout).push_str(text);
    }

    pub fn push_stderr(&self, text: &str) {
        for line in text.lines() {
            if !line.is_empty() {
                tracing::info!(target: "pylet::console", stream = "stderr", "{}", line);
            }
        }
        lock(&self.stderr).push_str(text);
    }

    pub fn take_stdout(&self) -> String {
        std::mem::take(&mut *lock(&self.stdout))
    }

    pub fn take_stderr(&self) -> String {
        std::mem::take(&mut *lock(&self.stderr))
    }
}

fn lock(buffer: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_accumulates_and_drains() {
        let console = Console::default();
        console.push_stdout("one\n");
        console.push_stdout("two\n");
        console.push_stderr("oops\n");

        assert_eq!(console.take_stdout(), "one\ntwo\n");
        assert_eq!(console.take_stdout(), "");
        assert_eq!(console.take_stderr(), "oops\n");
    }
}
