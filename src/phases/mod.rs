//! The three phase executors driven by the orchestrator.

use std::path::Path;

use crate::error::Result;
use crate::experiment_log::Exchange;
use crate::state::{AuditReport, ChangeSet, Issue, VerificationResult};

pub mod audit;
pub mod fix;
pub mod test;

pub use audit::LintAudit;
pub use fix::InferenceFix;
pub use test::PytestVerify;

/// What the audit hands to the rest of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditOutput {
    pub quality_score: f64,
    pub issues: Vec<Issue>,
    /// Target-relative file identifiers, deterministic for unchanged code.
    pub candidate_files: Vec<String>,
    pub plan: Vec<String>,
    /// The planning prompt and answer, when a service wrote the plan.
    pub exchange: Option<Exchange>,
}

impl AuditOutput {
    pub fn into_parts(self) -> (Vec<String>, AuditReport) {
        (
            self.candidate_files,
            AuditReport {
                quality_score: self.quality_score,
                issues: self.issues,
                plan: self.plan,
            },
        )
    }
}

/// Proposed replacement contents keyed by target-relative path. May be empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixOutput {
    pub changes: ChangeSet,
    pub exchange: Option<Exchange>,
}

/// Phase outputs that may carry a service exchange for the phase log.
pub trait Traced {
    fn exchange(&self) -> Option<&Exchange> {
        None
    }
}

impl Traced for AuditOutput {
    fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }
}

impl Traced for FixOutput {
    fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }
}

impl Traced for VerificationResult {}

/// Inputs for one Fix call, already cut down to the context budget.
#[derive(Debug, Clone, Copy)]
pub struct FixRequest<'a> {
    pub target: &'a Path,
    pub iteration: u32,
    pub files: &'a [String],
    pub issues: &'a [Issue],
    pub report: &'a AuditReport,
    /// Result of the previous iteration's test run, if any.
    pub feedback: Option<&'a VerificationResult>,
}

pub trait AuditPhase {
    fn audit(&self, target: &Path)
    -> impl std::future::Future<Output = Result<AuditOutput>> + Send;
}

pub trait FixPhase {
    fn fix(
        &self,
        request: FixRequest<'_>,
    ) -> impl std::future::Future<Output = Result<FixOutput>> + Send;
}

pub trait TestPhase {
    fn verify(
        &self,
        target: &Path,
    ) -> impl std::future::Future<Output = Result<VerificationResult>> + Send;
}
