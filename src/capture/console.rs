use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

use super::CaptureLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Error,
    Warn,
    Info,
}

impl ConsoleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Error => "error",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Info => "info",
        }
    }
}

/// Diagnostic console that tees every line: the original text goes to the
/// sink untouched, then the line is captured.
pub struct Console {
    capture: CaptureLayer,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

impl Console {
    pub fn stderr(capture: CaptureLayer) -> Self {
        Self::with_sink(capture, Box::new(std::io::stderr()))
    }

    pub fn with_sink(capture: CaptureLayer, sink: Box<dyn Write + Send>) -> Self {
        Self {
            capture,
            sink: Mutex::new(sink),
        }
    }

    pub fn error(&self, message: &str) {
        self.emit(ConsoleLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.emit(ConsoleLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.emit(ConsoleLevel::Info, message);
    }

    fn emit(&self, level: ConsoleLevel, message: &str) {
        {
            let mut sink = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if writeln!(sink, "{message}").and_then(|_| sink.flush()).is_err() {
                eprintln!("{message}");
            }
        }
        self.capture.capture_console(level, message);
    }
}
