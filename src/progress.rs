//! Run progress reporting.
//!
//! The pipeline emits [`RunProgress`] events to an abstract [`ProgressSink`]
//! through a per-run [`ProgressEmitter`], which assigns the strictly
//! increasing sequence numbers. Sinks decide where events go:
//!
//! | Sink | Output |
//! |------|--------|
//! | [`StderrProgress`] | `mapping  3 / 10  chunk 3/10 done` lines on stderr |
//! | [`JsonProgress`] | one JSON object per line on stderr |
//! | [`ChannelProgress`] | a tokio channel (the SSE transport reads it) |
//! | [`RecordingProgress`] | an in-memory list, for tests and embedding |
//! | [`NoProgress`] | nowhere |
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;
use std::str::FromStr;
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use crate::models::{RunProgress, Stage};

/// Receives progress events. Called in sequence order, never concurrently.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &RunProgress);
}

/// Numbers events and forwards them to a sink.
///
/// Sequence assignment and delivery happen under one lock, so the sink sees
/// sequence numbers in strictly increasing order even when stages emit from
/// several places.
pub struct ProgressEmitter<'a> {
    sink: &'a dyn ProgressSink,
    next: Mutex<u64>,
}

impl<'a> ProgressEmitter<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            next: Mutex::new(0),
        }
    }

    pub fn emit(&self, stage: Stage, completed: usize, total: usize, message: Option<String>) {
        let mut next = match self.next.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let event = RunProgress {
            sequence: *next,
            stage,
            completed,
            total,
            message,
        };
        *next += 1;
        self.sink.report(&event);
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        match self.next.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Human-friendly progress on stderr: `mapping  3 / 10  chunk 3/10 done`.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, event: &RunProgress) {
        let mut line = format!(
            "{:<9} {} / {}",
            event.stage.as_str(),
            format_number(event.completed as u64),
            format_number(event.total as u64)
        );
        if let Some(message) = &event.message {
            line.push_str("  ");
            line.push_str(message);
        }
        line.push('\n');
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn report(&self, event: &RunProgress) {
        let obj = serde_json::json!({
            "event": "progress",
            "sequence": event.sequence,
            "stage": event.stage,
            "completed": event.completed,
            "total": event.total,
            "message": event.message,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: &RunProgress) {}
}

/// Forwards events into an unbounded channel. A closed receiver is ignored.
pub struct ChannelProgress(pub UnboundedSender<RunProgress>);

impl ProgressSink for ChannelProgress {
    fn report(&self, event: &RunProgress) {
        let _ = self.0.send(event.clone());
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<RunProgress>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunProgress> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, event: &RunProgress) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{other}' (expected human, json or off)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn emitter_numbers_events_from_zero() {
        let sink = RecordingProgress::new();
        let emitter = ProgressEmitter::new(&sink);
        emitter.emit(Stage::Chunking, 0, 3, None);
        emitter.emit(Stage::Mapping, 1, 3, Some("chunk 1/3 done".into()));
        emitter.emit(Stage::Done, 3, 3, None);

        let seqs: Vec<u64> = sink.events().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(emitter.emitted(), 3);
        assert_eq!(sink.events()[1].message.as_deref(), Some("chunk 1/3 done"));
    }

    #[test]
    fn channel_sink_survives_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let sink = ChannelProgress(tx);
        ProgressEmitter::new(&sink).emit(Stage::Mapping, 0, 1, None);
    }

    #[test]
    fn progress_mode_parses() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert_eq!("off".parse::<ProgressMode>().unwrap(), ProgressMode::Off);
        assert!("loud".parse::<ProgressMode>().is_err());
    }
}
