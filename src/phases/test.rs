use std::path::Path;

use tracing::info;

use super::TestPhase;
use crate::analyzer::StaticAnalyzer;
use crate::error::Result;
use crate::pytest::TestRunner;
use crate::sandbox::Sandbox;
use crate::state::VerificationResult;

/// Runs the test suite, then re-scores the code with the static analyzer.
pub struct PytestVerify<R, A> {
    runner: R,
    analyzer: A,
}

impl<R: TestRunner + Sync, A: StaticAnalyzer + Sync> PytestVerify<R, A> {
    pub fn new(runner: R, analyzer: A) -> Self {
        Self { runner, analyzer }
    }
}

impl<R: TestRunner + Sync, A: StaticAnalyzer + Sync> TestPhase for PytestVerify<R, A> {
    async fn verify(&self, target: &Path) -> Result<VerificationResult> {
        let sandbox = Sandbox::new(target)?;
        let outcome = self.runner.run_tests(sandbox.root()).await?;
        let files = sandbox.list_files("py")?;
        let analysis = self.analyzer.analyze(sandbox.root(), &files).await?;

        info!(
            passed = outcome.passed,
            failures = outcome.failures.len(),
            quality_score = analysis.quality_score,
            "verification complete"
        );
        Ok(VerificationResult {
            passed: outcome.passed,
            failures: outcome.failures,
            quality_score: analysis.quality_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analysis;
    use crate::pytest::{TestCounts, TestOutcome};
    use crate::state::Failure;
    use std::fs;
    use tempfile::TempDir;

    struct FixedRunner(TestOutcome);

    impl TestRunner for FixedRunner {
        async fn run_tests(&self, _root: &Path) -> Result<TestOutcome> {
            Ok(self.0.clone())
        }
    }

    struct FixedAnalyzer(f64);

    impl StaticAnalyzer for FixedAnalyzer {
        async fn analyze(&self, _root: &Path, files: &[String]) -> Result<Analysis> {
            assert!(!files.is_empty());
            Ok(Analysis {
                quality_score: self.0,
                issues: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_verify_combines_outcome_and_score() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("calc.py"), "x = 1\n").unwrap();
        let failure = Failure {
            identifier: "tests/test_calc.py::test_add".to_string(),
            message: "assert 3 == 4".to_string(),
        };
        let phase = PytestVerify::new(
            FixedRunner(TestOutcome {
                passed: false,
                failures: vec![failure.clone()],
                counts: TestCounts {
                    passed: 0,
                    failed: 1,
                    errors: 0,
                },
            }),
            FixedAnalyzer(7.25),
        );
        let result = phase.verify(dir.path()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.failures, vec![failure]);
        assert_eq!(result.quality_score, 7.25);
        assert!(result.validate().is_ok());
    }
}
