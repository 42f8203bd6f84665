//! Per-run output capture.
//!
//! Every run owns one `OutputCapture`. Writes made through it are appended
//! to the run's buffer and, unless the capture is silent, forwarded to the
//! process stdout as they happen. Concurrent runs hold different handles, so
//! their output never mixes.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Cloneable handle to one run's output buffer.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    buf: Arc<Mutex<String>>,
    passthrough: bool,
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputCapture {
    /// Capture that also echoes writes to stdout.
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(String::new())),
            passthrough: true,
        }
    }

    /// Capture without the stdout echo.
    pub fn silent() -> Self {
        Self {
            passthrough: false,
            ..Self::new()
        }
    }

    /// Write text: echo (if enabled) and append to the buffer.
    pub fn write_str(&self, s: &str) {
        if self.passthrough {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(s.as_bytes());
            let _ = out.flush();
        }
        self.record(s);
    }

    /// Append to the buffer only. Used for log lines, which already reach
    /// the terminal through the tracing subscriber.
    pub(crate) fn record(&self, s: &str) {
        self.lock().push_str(s);
    }

    /// Snapshot of everything captured so far.
    pub fn contents(&self) -> String {
        self.lock().clone()
    }

    /// Drain the buffer. `None` if nothing was written.
    pub fn finish(&self) -> Option<String> {
        let text = std::mem::take(&mut *self.lock());
        if text.is_empty() { None } else { Some(text) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for OutputCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_str(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
