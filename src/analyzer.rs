use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};
use crate::state::{Issue, IssueLocation, Severity};

static SCORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"rated at (-?\d+(?:\.\d+)?)/10").expect("score regex is valid")
});

/// Pylint sets bit 32 of its exit status on usage errors.
const PYLINT_USAGE_ERROR: i32 = 32;

/// Result of one static-analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub quality_score: f64,
    pub issues: Vec<Issue>,
}

pub trait StaticAnalyzer {
    /// Analyze `files` (relative to `root`) and return a 0–10 score plus issues.
    fn analyze(
        &self,
        root: &Path,
        files: &[String],
    ) -> impl std::future::Future<Output = Result<Analysis>> + Send;
}

/// Runs `pylint` twice: once for JSON messages, once for the score line.
pub struct Pylint {
    binary: String,
    timeout: Option<Duration>,
}

impl Pylint {
    pub fn new(binary: String, timeout: Option<Duration>) -> Self {
        Self { binary, timeout }
    }

    fn config(&self, root: &Path, files: &[String], format: &str) -> ProcessConfig {
        let mut args = vec![format!("--output-format={format}")];
        args.extend(files.iter().cloned());
        ProcessConfig {
            args,
            timeout: self.timeout,
            log_prefix: format!("pylint:{format}"),
            ..ProcessConfig::new(self.binary.clone(), root)
        }
    }
}

impl StaticAnalyzer for Pylint {
    async fn analyze(&self, root: &Path, files: &[String]) -> Result<Analysis> {
        if files.is_empty() {
            info!("no source files to analyze");
            return Ok(Analysis {
                quality_score: 0.0,
                issues: Vec::new(),
            });
        }

        let json_run = spawn_and_stream(self.config(root, files, "json")).await?;
        check_exit(&json_run)?;
        let issues = parse_pylint_json(&json_run.stdout())?;

        let text_run = spawn_and_stream(self.config(root, files, "text")).await?;
        check_exit(&text_run)?;
        let quality_score = match parse_pylint_score(&text_run.stdout()) {
            Some(score) => score,
            None => {
                warn!("pylint printed no score line, assuming 0.0");
                0.0
            }
        };

        info!(
            files = files.len(),
            issues = issues.len(),
            quality_score,
            "static analysis complete"
        );
        Ok(Analysis {
            quality_score,
            issues,
        })
    }
}

fn check_exit(output: &crate::process::ProcessOutput) -> Result<()> {
    if let Some(sig) = output.signal {
        return Err(Error::Analyzer(format!("pylint killed by signal {sig}")));
    }
    if output.exit_code & PYLINT_USAGE_ERROR != 0 || output.exit_code < 0 {
        return Err(Error::Analyzer(format!(
            "pylint exited with code {}: {}",
            output.exit_code,
            output.stderr()
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PylintMessage {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    line: u32,
    symbol: String,
    message: String,
    #[serde(rename = "message-id")]
    message_id: String,
}

/// Parse `pylint --output-format=json` output into issues.
pub fn parse_pylint_json(stdout: &str) -> Result<Vec<Issue>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let messages: Vec<PylintMessage> = serde_json::from_str(trimmed)
        .map_err(|e| Error::Analyzer(format!("failed to parse pylint JSON: {e}")))?;
    Ok(messages
        .into_iter()
        .map(|m| Issue {
            location: IssueLocation {
                file: m.path.replace('\\', "/"),
                line: m.line,
            },
            severity: severity_for(&m.kind),
            message: format!("{} ({}): {}", m.symbol, m.message_id, m.message),
        })
        .collect())
}

/// Extract the "rated at X/10" score, clamped to the 0–10 scale.
pub fn parse_pylint_score(output: &str) -> Option<f64> {
    let caps = SCORE_RE.captures_iter(output).last()?;
    let score: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(score.clamp(0.0, 10.0))
}

fn severity_for(kind: &str) -> Severity {
    match kind {
        "fatal" => Severity::Critical,
        "error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => Severity::Info,
    }
}
