use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::budget::{issues_for_files, select_file_subset, select_issue_subset};
use crate::convergence::{ConvergencePolicy, should_continue};
use crate::error::{Error, Result};
use crate::experiment_log::{NullRecorder, PhaseRecord, PhaseRecorder, new_run_id};
use crate::phases::{AuditPhase, FixPhase, FixRequest, TestPhase, Traced};
use crate::sandbox::Sandbox;
use crate::state::{ChangeSet, Phase, RunState, TerminalReason, validate_score};

/// Caps on what a single Fix call sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub max_issues: usize,
    pub max_files: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_issues: 10,
            max_files: 3,
        }
    }
}

/// Retries for collaborator failures. Off unless `max_retries > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Settings {
    pub convergence: ConvergencePolicy,
    pub budgets: Budgets,
    pub retry: RetryPolicy,
}

/// Drives Audit once, then Fix → Test until a stop condition.
pub struct Orchestrator<A, F, T, P = NullRecorder> {
    audit: A,
    fix: F,
    test: T,
    recorder: P,
    settings: Settings,
    run_id: String,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<A: AuditPhase, F: FixPhase, T: TestPhase> Orchestrator<A, F, T> {
    pub fn new(audit: A, fix: F, test: T, settings: Settings) -> Self {
        Self::with_recorder(audit, fix, test, settings, NullRecorder)
    }
}

impl<A: AuditPhase, F: FixPhase, T: TestPhase, P: PhaseRecorder> Orchestrator<A, F, T, P> {
    pub fn with_recorder(audit: A, fix: F, test: T, settings: Settings, recorder: P) -> Self {
        Self {
            audit,
            fix,
            test,
            recorder,
            settings,
            run_id: new_run_id(),
            shutdown: None,
        }
    }

    /// Abort the in-flight collaborator call once `shutdown` turns true.
    /// The run then ends `FATAL_ERROR` with kind `interrupted`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute one workflow and return its terminal state.
    ///
    /// Never returns an unterminated state: every failure becomes
    /// `FATAL_ERROR` with the failing phase recorded.
    pub async fn run(&self, target: impl Into<PathBuf>, max_iterations: u32) -> RunState {
        let target = target.into();
        let mut state = RunState::new(target.clone(), max_iterations);
        info!(
            run_id = self.run_id,
            target = %target.display(),
            max_iterations,
            "starting run"
        );

        let sandbox = match preflight(&target, max_iterations) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.abort(&mut state, Phase::Setup, e);
                return state;
            }
        };

        if let Err((phase, e)) = self.drive(&mut state, &sandbox).await {
            self.abort(&mut state, phase, e);
        }

        info!(
            run_id = self.run_id,
            terminal_reason = %state.terminal_reason(),
            iterations = state.iteration(),
            initial_score = ?state.initial_quality_score(),
            final_score = ?state.final_quality_score(),
            "run finished"
        );
        state
    }

    async fn drive(
        &self,
        state: &mut RunState,
        sandbox: &Sandbox,
    ) -> std::result::Result<(), (Phase, Error)> {
        let root = sandbox.root();

        let audit = self
            .call(Phase::Audit, 0, move || self.audit.audit(root))
            .await
            .map_err(|e| (Phase::Audit, e))?;
        validate_score("audit", audit.quality_score).map_err(|e| (Phase::Audit, e))?;
        for file in &audit.candidate_files {
            sandbox.resolve(file).map_err(|e| (Phase::Audit, e))?;
        }
        info!(
            quality_score = audit.quality_score,
            issues = audit.issues.len(),
            candidates = audit.candidate_files.len(),
            "audit recorded"
        );
        let (candidates, report) = audit.into_parts();
        state
            .record_audit(candidates, report)
            .map_err(|e| (Phase::Audit, e))?;

        while !state.is_terminal() {
            if state.iteration() >= state.max_iterations() {
                state
                    .terminate(TerminalReason::MaxIterations)
                    .map_err(|e| (Phase::Fix, e))?;
                break;
            }
            let iteration = state.begin_iteration().map_err(|e| (Phase::Fix, e))?;
            info!(iteration, max = state.max_iterations(), "starting iteration");

            let changes = self
                .propose(state, root, iteration)
                .await
                .map_err(|e| (Phase::Fix, e))?;
            state
                .record_changes(changes)
                .map_err(|e| (Phase::Fix, e))?;
            self.apply(sandbox, state.proposed_changes(), iteration)
                .map_err(|e| (Phase::Apply, e))?;

            let verification = self
                .call(Phase::Test, iteration, move || self.test.verify(root))
                .await
                .map_err(|e| (Phase::Test, e))?;
            verification.validate().map_err(|e| (Phase::Test, e))?;
            let passed = verification.passed;
            info!(
                iteration,
                passed,
                failures = verification.failures.len(),
                quality_score = verification.quality_score,
                "test recorded"
            );
            state
                .record_verification(verification)
                .map_err(|e| (Phase::Test, e))?;

            if passed {
                state
                    .terminate(TerminalReason::Passed)
                    .map_err(|e| (Phase::Test, e))?;
                break;
            }

            // Any detector stop is reported as stagnation; MAX_ITERATIONS
            // only comes from the budget check at the top of the loop.
            let decision = should_continue(
                state.quality_history(),
                iteration,
                state.max_iterations(),
                &self.settings.convergence,
            );
            if !decision.should_continue() {
                info!(
                    iteration,
                    detector = ?decision.stop_reason(),
                    "convergence detector stopped the run"
                );
                state
                    .terminate(TerminalReason::Stagnation)
                    .map_err(|e| (Phase::Test, e))?;
            }
        }
        Ok(())
    }

    /// Budget the Fix inputs from the current state and call the Fix phase.
    async fn propose(&self, state: &RunState, root: &Path, iteration: u32) -> Result<ChangeSet> {
        let report = state
            .audit_report()
            .ok_or_else(|| Error::State("fix requested before audit".to_string()))?;
        let files = select_file_subset(
            state.candidate_files(),
            report,
            self.settings.budgets.max_files,
        );
        let issues = select_issue_subset(
            &issues_for_files(&report.issues, &files),
            self.settings.budgets.max_issues,
        );
        debug!(iteration, ?files, issues = issues.len(), "fix context selected");

        let request = FixRequest {
            target: root,
            iteration,
            files: &files,
            issues: &issues,
            report,
            feedback: state.verification_result(),
        };
        let output = self
            .call(Phase::Fix, iteration, move || self.fix.fix(request))
            .await?;
        Ok(output.changes)
    }

    fn apply(&self, sandbox: &Sandbox, changes: &ChangeSet, iteration: u32) -> Result<()> {
        if changes.is_empty() {
            info!(iteration, "fix proposed no changes");
            self.record(Phase::Apply, iteration, true, "no changes".to_string());
            return Ok(());
        }
        match sandbox.apply(changes) {
            Ok(written) => {
                info!(iteration, files = ?written, "changes applied");
                self.record(
                    Phase::Apply,
                    iteration,
                    true,
                    format!("wrote {}", written.join(", ")),
                );
                Ok(())
            }
            Err(e) => {
                self.record(Phase::Apply, iteration, false, e.to_string());
                Err(e)
            }
        }
    }

    /// Invoke a collaborator, retrying retryable failures per the policy, and log the outcome.
    async fn call<R, Fut, Op>(&self, phase: Phase, iteration: u32, mut op: Op) -> Result<R>
    where
        R: Traced,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let retry = self.settings.retry;
        let mut attempt = 0;
        loop {
            match self.until_shutdown(op()).await {
                Ok(value) => {
                    let detail = if attempt == 0 {
                        "ok".to_string()
                    } else {
                        format!("ok after {attempt} retries")
                    };
                    let mut record = PhaseRecord::new(&self.run_id, phase, iteration, true, detail);
                    if let Some(exchange) = value.exchange() {
                        record = record.with_exchange(exchange);
                    }
                    self.write(&record);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.backoff(attempt);
                    warn!(
                        %phase,
                        iteration,
                        attempt,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "retrying after collaborator failure"
                    );
                    self.record(phase, iteration, false, format!("retrying: {e}"));
                    let backoff = self.until_shutdown(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    });
                    if let Err(e) = backoff.await {
                        self.record(phase, iteration, false, e.to_string());
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.record(phase, iteration, false, e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// Await `fut` unless shutdown is requested first.
    async fn until_shutdown<R>(&self, fut: impl Future<Output = Result<R>>) -> Result<R> {
        let Some(mut shutdown) = self.shutdown.clone() else {
            return fut.await;
        };
        if *shutdown.borrow_and_update() {
            return Err(Error::Interrupted);
        }
        tokio::select! {
            result = fut => result,
            Ok(_) = shutdown.wait_for(|stop| *stop) => Err(Error::Interrupted),
        }
    }

    fn record(&self, phase: Phase, iteration: u32, success: bool, detail: String) {
        self.write(&PhaseRecord::new(&self.run_id, phase, iteration, success, detail));
    }

    fn write(&self, record: &PhaseRecord) {
        if let Err(e) = self.recorder.record(record) {
            warn!(error = %e, phase = %record.phase, "failed to write phase log");
        }
    }

    fn abort(&self, state: &mut RunState, phase: Phase, error: Error) {
        warn!(%phase, iteration = state.iteration(), kind = ?error.kind(), error = %error, "run failed");
        if phase == Phase::Setup {
            self.record(phase, 0, false, error.to_string());
        }
        if let Err(e) = state.fail(phase, &error) {
            warn!(error = %e, "could not record failure on run state");
        }
    }
}

fn preflight(target: &Path, max_iterations: u32) -> Result<Sandbox> {
    if max_iterations == 0 {
        return Err(Error::Validation(
            "max_iterations must be positive".to_string(),
        ));
    }
    Sandbox::new(target)
}
