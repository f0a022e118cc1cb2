//! Injected logging capability.
//!
//! The manager logs through an `Arc<dyn CapsuleLogger>` rather than the
//! global `tracing` dispatcher so a host can route capsule events anywhere
//! and tests can assert on them. [`TracingLogger`] is the default and
//! forwards everything to `tracing`.

use std::fmt;

/// Structured key/value pairs attached to a log event.
pub type Fields<'a> = &'a [(&'static str, &'a dyn fmt::Display)];

/// Leveled, structured logging sink used by the capsule host.
pub trait CapsuleLogger: Send + Sync {
    fn debug(&self, message: &str, fields: Fields<'_>);
    fn info(&self, message: &str, fields: Fields<'_>);
    fn warn(&self, message: &str, fields: Fields<'_>);
    fn error(&self, message: &str, fields: Fields<'_>);
}

/// Renders fields as `key=value` pairs separated by spaces.
struct DisplayFields<'a>(Fields<'a>);

impl fmt::Display for DisplayFields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

// ─── TracingLogger ───────────────────────────────────────────────────────────

/// Forwards capsule events to the `tracing` subscriber installed by the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl CapsuleLogger for TracingLogger {
    fn debug(&self, message: &str, fields: Fields<'_>) {
        tracing::debug!(target: "capsule_host", fields = %DisplayFields(fields), "{message}");
    }

    fn info(&self, message: &str, fields: Fields<'_>) {
        tracing::info!(target: "capsule_host", fields = %DisplayFields(fields), "{message}");
    }

    fn warn(&self, message: &str, fields: Fields<'_>) {
        tracing::warn!(target: "capsule_host", fields = %DisplayFields(fields), "{message}");
    }

    fn error(&self, message: &str, fields: Fields<'_>) {
        tracing::error!(target: "capsule_host", fields = %DisplayFields(fields), "{message}");
    }
}

// ─── Test Support ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::{CapsuleLogger, DisplayFields, Fields};

    /// A captured log event: level, message, rendered fields.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Record {
        pub level: &'static str,
        pub message: String,
        pub fields: String,
    }

    /// Logger that keeps every event in memory.
    #[derive(Debug, Default)]
    pub struct RecordingLogger {
        records: Mutex<Vec<Record>>,
    }

    impl RecordingLogger {
        pub fn records(&self) -> Vec<Record> {
            self.records.lock().unwrap().clone()
        }

        pub fn find(&self, message: &str) -> Option<Record> {
            self.records().into_iter().find(|r| r.message == message)
        }

        fn push(&self, level: &'static str, message: &str, fields: Fields<'_>) {
            self.records.lock().unwrap().push(Record {
                level,
                message: message.to_string(),
                fields: DisplayFields(fields).to_string(),
            });
        }
    }

    impl CapsuleLogger for RecordingLogger {
        fn debug(&self, message: &str, fields: Fields<'_>) {
            self.push("debug", message, fields);
        }

        fn info(&self, message: &str, fields: Fields<'_>) {
            self.push("info", message, fields);
        }

        fn warn(&self, message: &str, fields: Fields<'_>) {
            self.push("warn", message, fields);
        }

        fn error(&self, message: &str, fields: Fields<'_>) {
            self.push("error", message, fields);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
