// Export module for the layer profiler
// Writes recorded timings as JSON, CSV, Chrome trace or the text report

use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumString};

use super::record::{EventRecord, Phase};
use super::report::ProfileReport;
use crate::error::{Error, Result};

/// Output formats for recorded profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Structured report plus raw records
    Json,
    /// One row per record
    Csv,
    /// Complete events for chrome://tracing
    ChromeTrace,
    /// Per-iteration text report
    Text,
}

/// Owned copy of a profiler's state at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub pid: String,
    pub layer_num: usize,
    pub forward: Vec<EventRecord>,
    pub backward: Vec<EventRecord>,
}

impl ProfileSnapshot {
    pub fn records(&self, phase: Phase) -> &[EventRecord] {
        match phase {
            Phase::Forward => &self.forward,
            Phase::Backward => &self.backward,
        }
    }

    pub fn report(&self) -> Result<ProfileReport> {
        ProfileReport::build(self.layer_num, &self.forward, &self.backward)
    }

    /// 1-based `(iteration, layer)` of the record at `index`
    fn position(&self, phase: Phase, index: usize) -> (usize, usize) {
        let k = self.layer_num;
        if k == 0 {
            return (0, 0);
        }
        let layer = match phase {
            Phase::Forward => index % k + 1,
            Phase::Backward => k - index % k,
        };
        (index / k + 1, layer)
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    phase: Phase,
    iteration: usize,
    layer: usize,
    name: &'a str,
    start_ms: f64,
    end_ms: f64,
    elapsed_ms: f64,
}

/// Serialize a snapshot in the requested format
pub fn export_profile(snapshot: &ProfileSnapshot, format: ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            let document = json!({
                "pid": snapshot.pid,
                "layer_num": snapshot.layer_num,
                "report": snapshot.report()?,
                "records": {
                    "forward": snapshot.forward,
                    "backward": snapshot.backward,
                },
            });
            Ok(serde_json::to_vec_pretty(&document)?)
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            for phase in Phase::iter() {
                for (index, record) in snapshot.records(phase).iter().enumerate() {
                    let (iteration, layer) = snapshot.position(phase, index);
                    writer.serialize(CsvRow {
                        phase,
                        iteration,
                        layer,
                        name: &record.name,
                        start_ms: record.start_ms,
                        end_ms: record.end_ms,
                        elapsed_ms: record.elapsed_ms(),
                    })?;
                }
            }
            writer.into_inner().map_err(|e| Error::IoError(e.into_error()))
        }
        ExportFormat::ChromeTrace => {
            let mut trace_events = Vec::new();
            for (tid, phase) in Phase::iter().enumerate() {
                for (index, record) in snapshot.records(phase).iter().enumerate() {
                    let (iteration, layer) = snapshot.position(phase, index);
                    trace_events.push(json!({
                        "name": record.name,
                        "cat": phase.to_string(),
                        "ph": "X", // Complete event (with duration)
                        "ts": record.start_ms * 1000.0,
                        "dur": record.elapsed_ms() * 1000.0,
                        "pid": snapshot.pid,
                        "tid": tid,
                        "args": {
                            "iteration": iteration,
                            "layer": layer,
                        }
                    }));
                }
            }
            Ok(serde_json::to_vec_pretty(&trace_events)?)
        }
        ExportFormat::Text => Ok(snapshot.report()?.to_string().into_bytes()),
    }
}

/// Export to a file, creating parent directories as needed
pub fn write_profile(snapshot: &ProfileSnapshot, format: ExportFormat, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let bytes = export_profile(snapshot, format)?;
    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn snapshot() -> ProfileSnapshot {
        let record = |name: &str, start: f64| EventRecord::new(name, start, start + 0.5);
        ProfileSnapshot {
            pid: "77".to_string(),
            layer_num: 2,
            forward: vec![record("a", 0.0), record("b", 1.0), record("a", 4.0), record("b", 5.0)],
            backward: vec![record("b", 2.0), record("a", 3.0)],
        }
    }

    #[test]
    fn test_csv_has_one_row_per_record() {
        let bytes = export_profile(&snapshot(), ExportFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "phase,iteration,layer,name,start_ms,end_ms,elapsed_ms");
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[3], "forward,2,1,a,4.0,4.5,0.5");
        assert_eq!(lines[5], "backward,1,2,b,2.0,2.5,0.5");
    }

    #[test]
    fn test_chrome_trace_events() {
        let bytes = export_profile(&snapshot(), ExportFormat::ChromeTrace).unwrap();
        let events: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let events = events.as_array().unwrap();
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e["ph"] == "X"));
        assert_eq!(events[1]["ts"], 1000.0);
        assert_eq!(events[4]["cat"], "backward");
        assert_eq!(events[4]["tid"], 1);
    }

    #[test]
    fn test_json_carries_report_and_records() {
        let bytes = export_profile(&snapshot(), ExportFormat::Json).unwrap();
        let document: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(document["report"]["iterations"].as_array().unwrap().len(), 2);
        assert_eq!(document["records"]["forward"].as_array().unwrap().len(), 4);
        assert_eq!(document["pid"], "77");
    }

    #[test]
    fn test_inconsistent_snapshot_fails_report_formats() {
        let mut broken = snapshot();
        broken.forward.pop();
        assert!(export_profile(&broken, ExportFormat::Text).is_err());
        assert!(export_profile(&broken, ExportFormat::Csv).is_ok());
    }

    #[test]
    fn test_format_names() {
        assert_eq!(ExportFormat::ChromeTrace.to_string(), "chrome_trace");
        assert_eq!(ExportFormat::from_str("csv").unwrap(), ExportFormat::Csv);
    }

    #[test]
    fn test_write_profile_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("LOGS").join("trace.json");
        write_profile(&snapshot(), ExportFormat::ChromeTrace, &path).unwrap();
        assert!(path.is_file());
    }
}
