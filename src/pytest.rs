use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::info;

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, ProcessOutput, spawn_and_stream};
use crate::state::Failure;

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|errors?)\b").expect("count regex is valid")
});

static FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(FAILED|ERROR) (\S+)(?: - (.*))?$").expect("failure regex is valid")
});

/// pytest exit status when no tests were collected.
const NO_TESTS_COLLECTED: i32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub passed: bool,
    pub failures: Vec<Failure>,
    pub counts: TestCounts,
}

impl TestOutcome {
    fn clean() -> Self {
        Self {
            passed: true,
            failures: Vec::new(),
            counts: TestCounts::default(),
        }
    }
}

pub trait TestRunner {
    /// Run the project's test suite rooted at `root`.
    fn run_tests(&self, root: &Path)
    -> impl std::future::Future<Output = Result<TestOutcome>> + Send;
}

pub struct Pytest {
    binary: String,
    timeout: Option<Duration>,
}

impl Pytest {
    pub fn new(binary: String, timeout: Option<Duration>) -> Self {
        Self { binary, timeout }
    }

    pub fn build_args() -> Vec<String> {
        ["-q", "-rfE", "--tb=short", "--color=no", "-p", "no:cacheprovider"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl TestRunner for Pytest {
    async fn run_tests(&self, root: &Path) -> Result<TestOutcome> {
        if !has_test_files(root)? {
            info!("no test files found, treating as passed");
            return Ok(TestOutcome::clean());
        }

        let config = ProcessConfig {
            args: Self::build_args(),
            timeout: self.timeout,
            log_prefix: "pytest".to_string(),
            ..ProcessConfig::new(self.binary.clone(), root)
        };
        let output = spawn_and_stream(config).await?;
        let outcome = interpret_output(&output)?;
        info!(
            passed = outcome.counts.passed,
            failed = outcome.counts.failed,
            errors = outcome.counts.errors,
            "pytest finished"
        );
        Ok(outcome)
    }
}

/// Map a finished pytest process to an outcome.
///
/// Exit 0 and "no tests collected" pass. Exit 1 (failures) and 2 (collection
/// errors) fail. Anything else means pytest itself broke.
pub fn interpret_output(output: &ProcessOutput) -> Result<TestOutcome> {
    if let Some(sig) = output.signal {
        return Err(Error::TestRunner(format!("pytest killed by signal {sig}")));
    }
    let stdout = output.stdout();
    match output.exit_code {
        0 | NO_TESTS_COLLECTED => Ok(TestOutcome {
            counts: parse_counts(&stdout),
            ..TestOutcome::clean()
        }),
        1 | 2 => {
            let mut failures = parse_failures(&stdout);
            if failures.is_empty() {
                failures.push(Failure {
                    identifier: "pytest".to_string(),
                    message: format!("pytest exited with status {}", output.exit_code),
                });
            }
            Ok(TestOutcome {
                passed: false,
                failures,
                counts: parse_counts(&stdout),
            })
        }
        code => Err(Error::TestRunner(format!(
            "pytest exited with status {code}: {}",
            output.stderr()
        ))),
    }
}

/// Sum every "N passed / M failed / K error(s)" in the final summary line.
pub fn parse_counts(stdout: &str) -> TestCounts {
    let mut counts = TestCounts::default();
    let Some(summary) = stdout
        .lines()
        .rev()
        .find(|line| COUNT_RE.is_match(line))
    else {
        return counts;
    };
    for caps in COUNT_RE.captures_iter(summary) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "passed" => counts.passed += n,
            "failed" => counts.failed += n,
            _ => counts.errors += n,
        }
    }
    counts
}

/// Collect `FAILED <id> - <msg>` and `ERROR <id>` lines from the short summary.
pub fn parse_failures(stdout: &str) -> Vec<Failure> {
    stdout
        .lines()
        .filter_map(|line| {
            let caps = FAILURE_RE.captures(line.trim_end())?;
            let identifier = caps[2].to_string();
            let message = caps
                .get(3)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| format!("{} during collection or setup", &caps[1]));
            Some(Failure {
                identifier,
                message,
            })
        })
        .collect()
}

/// Whether `root` holds any `test_*.py` or `*_test.py` file.
pub fn has_test_files(root: &Path) -> Result<bool> {
    let sandbox = crate::sandbox::Sandbox::new(root)?;
    Ok(sandbox.list_files("py")?.iter().any(|path| {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.starts_with("test_") || name.ends_with("_test.py")
    }))
}
