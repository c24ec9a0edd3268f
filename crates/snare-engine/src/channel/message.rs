use serde::{Deserialize, Serialize};

/// Message sent by the instrumentation to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// The target module was confirmed present and the payload is loaded.
    Ready {
        /// Name of the target module.
        module: String,

        /// Base address of the target module.
        base: u64,
    },

    /// A hook was installed.
    Hooked {
        /// Hook name (or offset if unnamed).
        name: String,

        /// Absolute address of the hook.
        address: u64,
    },

    /// A hook was removed.
    Unhooked {
        /// Absolute address of the hook.
        address: u64,
    },

    /// Notification emitted from an interception.
    Event {
        /// Hook name (or offset if unnamed).
        hook: String,

        /// ID of the intercepted thread.
        thread_id: u64,

        /// Captured argument values.
        arguments: Vec<u64>,

        /// Capture time, in microseconds since the Unix epoch.
        timestamp_us: u64,
    },

    /// Log line.
    Log {
        /// Severity.
        level: LogLevel,

        /// Content.
        text: String,
    },

    /// Error that didn't abort the instrumentation.
    Error {
        /// Description of the error.
        text: String,
    },

    /// Application-defined message.
    Custom {
        /// Message tag.
        tag: String,

        /// Message content.
        data: Vec<u8>,
    },
}

/// Command sent by the controller to the instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Liveness check, answered by a `pong` log message.
    Ping,

    /// Application-defined command.
    Custom {
        /// Command tag.
        tag: String,

        /// Command content.
        data: Vec<u8>,
    },
}

/// Severity of a [Message::Log].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Debug information.
    Debug,

    /// Regular information.
    Info,

    /// Recoverable problem.
    Warn,
}

impl Message {
    /// Creates a log message.
    pub fn log(level: LogLevel, text: impl Into<String>) -> Self {
        Self::Log {
            level,
            text: text.into(),
        }
    }

    /// Creates an error message.
    pub fn error(text: impl std::fmt::Display) -> Self {
        Self::Error {
            text: text.to_string(),
        }
    }
}
