#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use refactor_swarm::error::{Error, Result};
use refactor_swarm::experiment_log::{Exchange, PhaseRecord, PhaseRecorder};
use refactor_swarm::phases::{
    AuditOutput, AuditPhase, FixOutput, FixPhase, FixRequest, TestPhase,
};
use refactor_swarm::state::{
    ChangeSet, Failure, Issue, IssueLocation, Severity, VerificationResult,
};

pub fn issue(file: &str, line: u32, severity: Severity) -> Issue {
    Issue {
        location: IssueLocation {
            file: file.to_string(),
            line,
        },
        severity,
        message: format!("{severity} issue at {file}:{line}"),
    }
}

pub fn audit_output(score: f64, issues: Vec<Issue>, files: &[&str]) -> AuditOutput {
    AuditOutput {
        quality_score: score,
        issues,
        candidate_files: files.iter().map(|f| f.to_string()).collect(),
        plan: vec!["Fix all detected issues".to_string()],
        exchange: None,
    }
}

pub fn exchange(model: &str, prompt: &str, response: &str) -> Exchange {
    Exchange {
        model: model.to_string(),
        prompt: prompt.to_string(),
        response: response.to_string(),
    }
}

pub fn passed(score: f64) -> VerificationResult {
    VerificationResult {
        passed: true,
        failures: vec![],
        quality_score: score,
    }
}

pub fn failed(score: f64) -> VerificationResult {
    VerificationResult {
        passed: false,
        failures: vec![Failure {
            identifier: "tests/test_calc.py::test_add".to_string(),
            message: "assert 3 == 4".to_string(),
        }],
        quality_score: score,
    }
}

pub fn changes(pairs: &[(&str, &str)]) -> ChangeSet {
    pairs
        .iter()
        .map(|(p, c)| (p.to_string(), c.to_string()))
        .collect()
}

/// A small Python project with two source files and one test file.
pub fn project() -> tempfile::TempDir {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("calc.py"), "def add(a, b):\n    return a - b\n").unwrap();
    std::fs::write(dir.path().join("util.py"), "import os\n").unwrap();
    std::fs::create_dir(dir.path().join("tests")).unwrap();
    std::fs::write(
        dir.path().join("tests/test_calc.py"),
        "from calc import add\n\ndef test_add():\n    assert add(1, 2) == 3\n",
    )
    .unwrap();
    dir
}

// --- Mock phases ---

pub struct MockAudit {
    results: Mutex<VecDeque<Result<AuditOutput>>>,
    pub calls: Arc<Mutex<usize>>,
}

impl MockAudit {
    pub fn new(results: Vec<Result<AuditOutput>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Arc::new(Mutex::new(0)),
        }
    }
}

impl AuditPhase for MockAudit {
    async fn audit(&self, target: &Path) -> Result<AuditOutput> {
        assert!(target.is_dir());
        *self.calls.lock().unwrap() += 1;
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Analyzer("no scripted audit result".to_string())))
    }
}

/// What the orchestrator handed to one Fix call.
#[derive(Debug, Clone)]
pub struct RecordedFix {
    pub iteration: u32,
    pub files: Vec<String>,
    pub issues: Vec<Issue>,
    pub feedback: Option<VerificationResult>,
}

pub struct MockFix {
    results: Mutex<VecDeque<Result<ChangeSet>>>,
    exchange: Option<Exchange>,
    pub requests: Arc<Mutex<Vec<RecordedFix>>>,
}

impl MockFix {
    pub fn new(results: Vec<Result<ChangeSet>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            exchange: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach `exchange` to every successful proposal.
    pub fn with_exchange(mut self, exchange: Exchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// A fixer that always proposes nothing.
    pub fn noop(iterations: usize) -> Self {
        Self::new((0..iterations).map(|_| Ok(ChangeSet::new())).collect())
    }
}

impl FixPhase for MockFix {
    async fn fix(&self, request: FixRequest<'_>) -> Result<FixOutput> {
        self.requests.lock().unwrap().push(RecordedFix {
            iteration: request.iteration,
            files: request.files.to_vec(),
            issues: request.issues.to_vec(),
            feedback: request.feedback.cloned(),
        });
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Inference("no scripted fix result".to_string())))
            .map(|changes| FixOutput {
                changes,
                exchange: self.exchange.clone(),
            })
    }
}

pub struct MockTest {
    results: Mutex<VecDeque<Result<VerificationResult>>>,
    pub calls: Arc<Mutex<usize>>,
}

impl MockTest {
    pub fn new(results: Vec<Result<VerificationResult>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: Arc::new(Mutex::new(0)),
        }
    }
}

impl TestPhase for MockTest {
    async fn verify(&self, _target: &Path) -> Result<VerificationResult> {
        *self.calls.lock().unwrap() += 1;
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::TestRunner("no scripted test result".to_string())))
    }
}

/// A test runner that takes `delay` before reporting a pass.
pub struct SlowTest {
    pub delay: Duration,
    pub calls: Arc<Mutex<usize>>,
}

impl SlowTest {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Arc::new(Mutex::new(0)),
        }
    }
}

impl TestPhase for SlowTest {
    async fn verify(&self, _target: &Path) -> Result<VerificationResult> {
        *self.calls.lock().unwrap() += 1;
        tokio::time::sleep(self.delay).await;
        Ok(passed(9.0))
    }
}

// --- Recorders ---

#[derive(Clone, Default)]
pub struct MemoryRecorder {
    pub records: Arc<Mutex<Vec<PhaseRecord>>>,
}

impl PhaseRecorder for MemoryRecorder {
    fn record(&self, record: &PhaseRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

pub struct FailingRecorder;

impl PhaseRecorder for FailingRecorder {
    fn record(&self, _record: &PhaseRecord) -> Result<()> {
        Err(Error::PhaseLog("disk full".to_string()))
    }
}
