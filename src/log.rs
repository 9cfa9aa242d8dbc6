use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

/// Message severity, ordered. `Notice` and `Critical` have no direct tracing
/// counterpart and are emitted as info/error with a `severity` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

const FLOOD_DELAY: Duration = Duration::from_secs(5);
const FLOOD_MIN_REPEATS: u64 = 3;

struct FloodState {
    last_message: String,
    last_occurrence: Instant,
    occurrences: u64,
}

/// Leveled log sink handed explicitly to the resolver and cache components.
///
/// Identical consecutive messages repeated more than [`FLOOD_MIN_REPEATS`] times
/// within [`FLOOD_DELAY`] are dropped until the message changes.
#[derive(Clone)]
pub struct LogSink {
    min_level: Severity,
    flood: Arc<Mutex<FloodState>>,
}

impl LogSink {
    pub fn new(min_level: Severity) -> Self {
        Self {
            min_level,
            flood: Arc::new(Mutex::new(FloodState {
                last_message: String::new(),
                last_occurrence: Instant::now(),
                occurrences: 0,
            })),
        }
    }

    pub fn log(&self, severity: Severity, message: &str) {
        if severity < self.min_level || message.is_empty() {
            return;
        }
        if !self.passes_flood_filter(message) {
            return;
        }
        match severity {
            Severity::Debug => debug!("{message}"),
            Severity::Info => info!("{message}"),
            Severity::Notice => info!(severity = "notice", "{message}"),
            Severity::Warning => warn!("{message}"),
            Severity::Error => error!("{message}"),
            Severity::Critical => error!(severity = "critical", "{message}"),
        }
    }

    fn passes_flood_filter(&self, message: &str) -> bool {
        let mut state = self.flood.lock().expect("flood filter lock poisoned");
        if state.last_message == message {
            if state.last_occurrence.elapsed() < FLOOD_DELAY {
                state.occurrences += 1;
                if state.occurrences > FLOOD_MIN_REPEATS {
                    return false;
                }
            }
        } else {
            state.occurrences = 0;
            state.last_message = message.to_string();
        }
        state.last_occurrence = Instant::now();
        true
    }

    pub fn debug(&self, message: &str) {
        self.log(Severity::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    pub fn notice(&self, message: &str) {
        self.log(Severity::Notice, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }

    pub fn critical(&self, message: &str) {
        self.log(Severity::Critical, message);
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(Severity::Debug)
    }
}
