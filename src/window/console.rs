use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub text: String,
}

/// Console shared by the windows of one page. Every message is recorded
/// and also forwarded to `tracing` under the `console` target.
#[derive(Clone, Default)]
pub struct VirtualConsole {
    messages: Arc<Mutex<Vec<ConsoleMessage>>>,
}

impl fmt::Debug for VirtualConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConsole")
            .field("messages", &self.messages.lock().len())
            .finish()
    }
}

impl VirtualConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, level: ConsoleLevel, text: &str) {
        match level {
            ConsoleLevel::Debug => debug!(target: "console", "{text}"),
            ConsoleLevel::Log | ConsoleLevel::Info => info!(target: "console", "{text}"),
            ConsoleLevel::Warn => warn!(target: "console", "{text}"),
            ConsoleLevel::Error => error!(target: "console", "{text}"),
        }
        self.messages.lock().push(ConsoleMessage {
            level,
            text: text.to_string(),
        });
    }

    pub fn debug(&self, text: &str) {
        self.record(ConsoleLevel::Debug, text);
    }

    pub fn log(&self, text: &str) {
        self.record(ConsoleLevel::Log, text);
    }

    pub fn info(&self, text: &str) {
        self.record(ConsoleLevel::Info, text);
    }

    pub fn warn(&self, text: &str) {
        self.record(ConsoleLevel::Warn, text);
    }

    pub fn error(&self, text: &str) {
        self.record(ConsoleLevel::Error, text);
    }

    pub fn messages(&self) -> Vec<ConsoleMessage> {
        self.messages.lock().clone()
    }

    pub fn messages_at(&self, level: ConsoleLevel) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.level == level)
            .map(|message| message.text.clone())
            .collect()
    }

    /// Everything logged so far, one message per line.
    pub fn output(&self) -> String {
        self.messages
            .lock()
            .iter()
            .map(|message| message.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}
