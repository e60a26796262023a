// Record log for the layer profiler
// Holds the append-only forward and backward timing records

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Direction of the computation a record was taken from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Forward,
    Backward,
}

/// One timed leaf computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Qualified name of the leaf
    pub name: String,
    /// Milliseconds since the profiler was created
    pub start_ms: f64,
    pub end_ms: f64,
}

impl EventRecord {
    pub fn new(name: impl Into<String>, start_ms: f64, end_ms: f64) -> Self {
        Self {
            name: name.into(),
            start_ms,
            end_ms,
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.end_ms - self.start_ms
    }
}

/// Thread-safe append-only record store, one sequence per phase
#[derive(Debug, Default)]
pub struct RecordLog {
    forward: Mutex<Vec<EventRecord>>,
    backward: Mutex<Vec<EventRecord>>,
}

impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, phase: Phase) -> &Mutex<Vec<EventRecord>> {
        match phase {
            Phase::Forward => &self.forward,
            Phase::Backward => &self.backward,
        }
    }

    /// Append a record
    pub fn append(&self, phase: Phase, record: EventRecord) {
        if let Ok(mut records) = self.slot(phase).lock() {
            records.push(record);
        }
    }

    pub fn len(&self, phase: Phase) -> usize {
        self.slot(phase).lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len(Phase::Forward) == 0 && self.len(Phase::Backward) == 0
    }

    /// Copy of all records of a phase, in append order
    pub fn snapshot(&self, phase: Phase) -> Vec<EventRecord> {
        if let Ok(records) = self.slot(phase).lock() {
            records.clone()
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_phases_are_kept_apart() {
        let log = RecordLog::new();
        assert!(log.is_empty());
        log.append(Phase::Forward, EventRecord::new("a", 0.0, 1.5));
        log.append(Phase::Forward, EventRecord::new("b", 1.5, 2.0));
        log.append(Phase::Backward, EventRecord::new("b", 3.0, 3.25));

        assert_eq!(log.len(Phase::Forward), 2);
        assert_eq!(log.len(Phase::Backward), 1);
        let forward = log.snapshot(Phase::Forward);
        assert_eq!(forward[0].name, "a");
        assert_eq!(forward[1].elapsed_ms(), 0.5);
    }

    #[test]
    fn test_phase_names() {
        let names: Vec<String> = Phase::iter().map(|p| p.to_string()).collect();
        assert_eq!(names, vec!["forward", "backward"]);
        assert_eq!(Phase::from_str("backward").unwrap(), Phase::Backward);
    }
}
