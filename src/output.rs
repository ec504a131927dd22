//! Console output shared by every runner.
//!
//! The console is the one piece of shared mutable state in a batch. Every line
//! goes through `OutputMultiplexer`, which formats it completely and writes it
//! under a single lock so concurrent runners never tear each other's lines.

use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::ansi::{BackgroundColor, RESET};

/// Serializes line writes from concurrent runners onto one sink.
pub struct OutputMultiplexer {
    sink: Mutex<Box<dyn Write + Send>>,
    colored: bool,
}

impl OutputMultiplexer {
    pub fn new(sink: impl Write + Send + 'static, colored: bool) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            colored,
        }
    }

    pub fn stdout(colored: bool) -> Self {
        Self::new(io::stdout(), colored)
    }

    /// Writes one labelled line.
    pub fn write(&self, color: BackgroundColor, prefix: &str, line: &str) {
        let formatted = format_line(color, prefix, line, self.colored);
        self.write_raw(&formatted);
    }

    /// Writes an unlabelled status line.
    pub fn notice(&self, text: &str) {
        self.write_raw(text);
    }

    fn write_raw(&self, text: &str) {
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text.as_bytes());
        buf.push(b'\n');
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = sink.write_all(&buf).and_then(|_| sink.flush()) {
            debug!(error = %err, "console write failed");
        }
    }
}

/// Renders `<color><prefix><reset> <line>`, or just `<line>` when the prefix is empty.
pub fn format_line(color: BackgroundColor, prefix: &str, line: &str, colored: bool) -> String {
    if prefix.is_empty() {
        return line.to_string();
    }
    if colored {
        format!("{}{}{} {}", color.escape(), prefix, RESET, line)
    } else {
        format!("{} {}", prefix, line)
    }
}
