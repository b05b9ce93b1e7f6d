use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, FailureKind, Result};

/// Issue severity, declared in ascending order so `Ord` ranks `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Weight used when ranking files by the issues they carry.
    pub fn weight(self) -> u32 {
        match self {
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Error => 4,
            Severity::Critical => 8,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLocation {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for IssueLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub location: IssueLocation,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub quality_score: f64,
    pub issues: Vec<Issue>,
    pub plan: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub identifier: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub failures: Vec<Failure>,
    pub quality_score: f64,
}

impl VerificationResult {
    /// Enforce the test-output contract: `failures` is empty iff `passed`.
    pub fn validate(&self) -> Result<()> {
        if self.passed && !self.failures.is_empty() {
            return Err(Error::Validation(format!(
                "test result reports passed with {} failure(s)",
                self.failures.len()
            )));
        }
        if !self.passed && self.failures.is_empty() {
            return Err(Error::Validation(
                "test result reports failure without failure details".to_string(),
            ));
        }
        validate_score("test", self.quality_score)
    }
}

/// Quality scores live on the analyzer's 0–10 scale.
pub fn validate_score(phase: &str, score: f64) -> Result<()> {
    if !score.is_finite() || !(0.0..=10.0).contains(&score) {
        return Err(Error::Validation(format!(
            "{phase} quality score out of range: {score}"
        )));
    }
    Ok(())
}

/// Proposed replacement content keyed by file identifier.
pub type ChangeSet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalReason {
    Unstarted,
    Passed,
    MaxIterations,
    Stagnation,
    FatalError,
}

impl TerminalReason {
    pub fn is_success(self) -> bool {
        self == TerminalReason::Passed
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::Unstarted => write!(f, "UNSTARTED"),
            TerminalReason::Passed => write!(f, "PASSED"),
            TerminalReason::MaxIterations => write!(f, "MAX_ITERATIONS"),
            TerminalReason::Stagnation => write!(f, "STAGNATION"),
            TerminalReason::FatalError => write!(f, "FATAL_ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Audit,
    Fix,
    Apply,
    Test,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Setup => write!(f, "setup"),
            Phase::Audit => write!(f, "audit"),
            Phase::Fix => write!(f, "fix"),
            Phase::Apply => write!(f, "apply"),
            Phase::Test => write!(f, "test"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub phase: Phase,
    pub iteration: u32,
    pub kind: FailureKind,
    pub message: String,
}

/// The record threaded through one workflow execution.
///
/// Fields are private; every mutation goes through a transition method that
/// checks the lifecycle and bumps `version`. Once `terminal_reason` leaves
/// `Unstarted` all further transitions are rejected.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    target: PathBuf,
    max_iterations: u32,
    iteration: u32,
    candidate_files: Vec<String>,
    audit_report: Option<AuditReport>,
    proposed_changes: ChangeSet,
    verification_result: Option<VerificationResult>,
    quality_history: Vec<f64>,
    terminal_reason: TerminalReason,
    failure: Option<FailureDetail>,
    version: u64,
    started_at: u64,
    finished_at: Option<u64>,
}

impl RunState {
    pub fn new(target: impl Into<PathBuf>, max_iterations: u32) -> Self {
        Self {
            target: target.into(),
            max_iterations,
            iteration: 0,
            candidate_files: Vec::new(),
            audit_report: None,
            proposed_changes: ChangeSet::new(),
            verification_result: None,
            quality_history: Vec::new(),
            terminal_reason: TerminalReason::Unstarted,
            failure: None,
            version: 0,
            started_at: unix_now(),
            finished_at: None,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn candidate_files(&self) -> &[String] {
        &self.candidate_files
    }

    pub fn audit_report(&self) -> Option<&AuditReport> {
        self.audit_report.as_ref()
    }

    pub fn proposed_changes(&self) -> &ChangeSet {
        &self.proposed_changes
    }

    pub fn verification_result(&self) -> Option<&VerificationResult> {
        self.verification_result.as_ref()
    }

    pub fn quality_history(&self) -> &[f64] {
        &self.quality_history
    }

    pub fn terminal_reason(&self) -> TerminalReason {
        self.terminal_reason
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        self.failure.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<u64> {
        self.finished_at
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_reason != TerminalReason::Unstarted
    }

    /// Score reported by the audit, if it ran.
    pub fn initial_quality_score(&self) -> Option<f64> {
        self.quality_history.first().copied()
    }

    /// Most recent score in the history.
    pub fn final_quality_score(&self) -> Option<f64> {
        self.quality_history.last().copied()
    }

    /// Store the audit output. Allowed exactly once, before any iteration.
    pub fn record_audit(&mut self, candidate_files: Vec<String>, report: AuditReport) -> Result<()> {
        self.ensure_active("record audit")?;
        if self.audit_report.is_some() {
            return Err(Error::State("audit report already recorded".to_string()));
        }
        self.quality_history.push(report.quality_score);
        self.candidate_files = candidate_files;
        self.audit_report = Some(report);
        self.bump();
        Ok(())
    }

    /// Start the next Fix/Test cycle and return its 1-based number.
    pub fn begin_iteration(&mut self) -> Result<u32> {
        self.ensure_active("begin iteration")?;
        if self.audit_report.is_none() {
            return Err(Error::State(
                "cannot begin an iteration before the audit".to_string(),
            ));
        }
        if self.iteration >= self.max_iterations {
            return Err(Error::State(format!(
                "iteration budget of {} already spent",
                self.max_iterations
            )));
        }
        self.iteration += 1;
        self.bump();
        Ok(self.iteration)
    }

    pub fn record_changes(&mut self, changes: ChangeSet) -> Result<()> {
        self.ensure_active("record changes")?;
        self.proposed_changes = changes;
        self.bump();
        Ok(())
    }

    /// Store the test outcome and append its score to the quality history.
    pub fn record_verification(&mut self, result: VerificationResult) -> Result<()> {
        self.ensure_active("record verification")?;
        self.quality_history.push(result.quality_score);
        self.verification_result = Some(result);
        self.bump();
        Ok(())
    }

    /// Set the terminal reason. Allowed exactly once.
    pub fn terminate(&mut self, reason: TerminalReason) -> Result<()> {
        if reason == TerminalReason::Unstarted {
            return Err(Error::State(
                "cannot terminate with reason UNSTARTED".to_string(),
            ));
        }
        self.ensure_active("terminate")?;
        self.terminal_reason = reason;
        self.finished_at = Some(unix_now());
        self.bump();
        Ok(())
    }

    /// Terminate with `FATAL_ERROR`, keeping the failure detail.
    pub fn fail(&mut self, phase: Phase, error: &Error) -> Result<()> {
        self.ensure_active("record failure")?;
        self.failure = Some(FailureDetail {
            phase,
            iteration: self.iteration,
            kind: error.kind(),
            message: error.to_string(),
        });
        self.terminate(TerminalReason::FatalError)
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::State(format!(
                "cannot {action}: run already terminated with {}",
                self.terminal_reason
            )));
        }
        Ok(())
    }

    fn bump(&mut self) {
        self.version += 1;
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
