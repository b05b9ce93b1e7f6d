//! Append-only JSON-lines record of every phase invocation.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::state::{Phase, unix_now};

pub const DEFAULT_LOG_PATH: &str = "logs/experiment_data.jsonl";

/// Kind of work a logged call performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Analysis,
    Fix,
    Debug,
}

impl Action {
    pub fn for_phase(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Audit => Some(Action::Analysis),
            Phase::Fix => Some(Action::Fix),
            Phase::Test => Some(Action::Debug),
            Phase::Setup | Phase::Apply => None,
        }
    }
}

/// One prompt/answer round trip with the generative service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub model: String,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub run_id: String,
    pub phase: Phase,
    pub iteration: u32,
    pub timestamp: u64,
    pub success: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_response: Option<String>,
}

impl PhaseRecord {
    pub fn new(run_id: &str, phase: Phase, iteration: u32, success: bool, detail: String) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase,
            iteration,
            timestamp: unix_now(),
            success,
            detail,
            action: Action::for_phase(phase),
            model_used: None,
            input_prompt: None,
            output_response: None,
        }
    }

    /// Attach the service exchange that produced this call's output.
    pub fn with_exchange(mut self, exchange: &Exchange) -> Self {
        self.model_used = Some(exchange.model.clone());
        self.input_prompt = Some(exchange.prompt.clone());
        self.output_response = Some(exchange.response.clone());
        self
    }
}

pub trait PhaseRecorder {
    fn record(&self, record: &PhaseRecord) -> Result<()>;
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl PhaseRecorder for NullRecorder {
    fn record(&self, _record: &PhaseRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file, creating parent directories on demand.
#[derive(Debug)]
pub struct ExperimentLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ExperimentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back from a log file.
    pub fn read_all(path: &Path) -> Result<Vec<PhaseRecord>> {
        let contents = std::fs::read_to_string(path)?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| Error::PhaseLog(format!("malformed log line: {e}")))
            })
            .collect()
    }
}

impl PhaseRecorder for ExperimentLog {
    fn record(&self, record: &PhaseRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| Error::PhaseLog(format!("failed to encode record: {e}")))?;
        line.push('\n');

        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::PhaseLog("log lock poisoned".to_string()))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::PhaseLog(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::PhaseLog(format!("failed to open {}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::PhaseLog(format!("failed to write {}: {e}", self.path.display())))?;
        debug!(phase = %record.phase, iteration = record.iteration, "phase recorded");
        Ok(())
    }
}

/// Identifier shared by every record of one run.
pub fn new_run_id() -> String {
    format!("run-{}-{}", unix_now(), std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(phase: Phase, iteration: u32, success: bool) -> PhaseRecord {
        PhaseRecord {
            timestamp: 1_700_000_000,
            ..PhaseRecord::new("run-1-2", phase, iteration, success, "ok".to_string())
        }
    }

    #[test]
    fn test_appends_json_lines_and_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/logs/experiment_data.jsonl");
        let log = ExperimentLog::new(&path);
        log.record(&record(Phase::Audit, 0, true)).unwrap();
        log.record(&record(Phase::Fix, 1, false)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["phase"], "audit");
        assert_eq!(first["success"], true);

        let records = ExperimentLog::read_all(&path).unwrap();
        assert_eq!(records[1], record(Phase::Fix, 1, false));
    }

    #[test]
    fn test_exchange_fields_are_logged() {
        let dir = TempDir::new().unwrap();
        let log = ExperimentLog::new(dir.path().join("log.jsonl"));
        let exchange = Exchange {
            model: "gemini-2.5-flash".to_string(),
            prompt: "# Refactoring Fix Agent ...".to_string(),
            response: r#"{"changes": []}"#.to_string(),
        };
        log.record(&record(Phase::Fix, 1, true).with_exchange(&exchange))
            .unwrap();
        log.record(&record(Phase::Apply, 1, true)).unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["action"], "FIX");
        assert_eq!(lines[0]["model_used"], "gemini-2.5-flash");
        assert_eq!(lines[0]["input_prompt"], "# Refactoring Fix Agent ...");
        assert_eq!(lines[0]["output_response"], r#"{"changes": []}"#);
        assert!(lines[1].get("action").is_none());
        assert!(lines[1].get("input_prompt").is_none());

        let records = ExperimentLog::read_all(log.path()).unwrap();
        assert_eq!(records[0].output_response.as_deref(), Some(r#"{"changes": []}"#));
    }

    #[test]
    fn test_actions_follow_phase() {
        assert_eq!(Action::for_phase(Phase::Audit), Some(Action::Analysis));
        assert_eq!(Action::for_phase(Phase::Test), Some(Action::Debug));
        assert_eq!(Action::for_phase(Phase::Apply), None);
    }

    #[test]
    fn test_appends_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        ExperimentLog::new(&path).record(&record(Phase::Audit, 0, true)).unwrap();
        ExperimentLog::new(&path).record(&record(Phase::Test, 1, true)).unwrap();
        assert_eq!(ExperimentLog::read_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_unwritable_path_errors() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let log = ExperimentLog::new(blocker.join("log.jsonl"));
        let err = log.record(&record(Phase::Audit, 0, true)).unwrap_err();
        assert!(matches!(err, Error::PhaseLog(_)));
    }

    #[test]
    fn test_run_id_format() {
        assert!(new_run_id().starts_with("run-"));
    }
}
