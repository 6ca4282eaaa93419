//! Structured progress surface shared by the synchronizer, builder and
//! configurator.
//!
//! Library code never writes to stdout/stderr directly; instead every
//! long-running operation takes a [`ProgressSink`] closure and calls it
//! at well-defined points. The CLI installs a sink that prints a line per
//! event; embedders can install their own (a GUI progress bar, a JSON
//! event stream, or nothing at all).

use std::fmt;

/// A single progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Human-readable description of the step that just started or finished.
    pub message: String,
}

impl Progress {
    /// Build a progress event from anything stringly-shaped.
    pub fn new(message: impl Into<String>) -> Self {
        Progress {
            message: message.into(),
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Callback invoked at well-defined points of a long-running operation.
pub type ProgressSink<'a> = dyn FnMut(Progress) + 'a;

/// A no-op sink for callers that don't care about progress.
pub fn silent(_: Progress) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_as_its_message() {
        let p = Progress::new("cloning frida-core");
        assert_eq!(p.to_string(), "cloning frida-core");
    }

    #[test]
    fn sink_receives_events_in_order() {
        let mut seen = Vec::new();
        {
            let mut sink = |p: Progress| seen.push(p.message);
            sink(Progress::new("one"));
            sink(Progress::new("two"));
        }
        assert_eq!(seen, vec!["one".to_string(), "two".to_string()]);
    }
}
