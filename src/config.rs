use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::Cli;
use crate::convergence::{ConvergencePolicy, DEFAULT_EPSILON, DEFAULT_STAGNATION_WINDOW};
use crate::error::{Error, Result};
use crate::experiment_log::DEFAULT_LOG_PATH;
use crate::inference::Backend;
use crate::orchestrator::{Budgets, RetryPolicy};

pub const DEFAULT_CONFIG_PATH: &str = ".refactor-swarm.toml";

const DEFAULT_MAX_ITERATIONS: u32 = 10;
const DEFAULT_MAX_ISSUES: usize = 10;
const DEFAULT_MAX_FILES: usize = 3;
const DEFAULT_MAX_PLAN_ITEMS: usize = 8;
const DEFAULT_MAX_LINES_PER_FILE: usize = 400;
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub max_iterations: Option<u32>,
    pub stagnation_window: Option<usize>,
    pub epsilon: Option<f64>,
    pub max_issues: Option<usize>,
    pub max_files: Option<usize>,
    pub max_plan_items: Option<usize>,
    pub max_lines_per_file: Option<usize>,
    pub inference: Option<String>,
    pub agent_binary: Option<String>,
    pub model: Option<String>,
    pub inference_timeout: Option<u64>,
    pub analyzer_binary: Option<String>,
    pub test_binary: Option<String>,
    pub tool_timeout: Option<u64>,
    pub log_path: Option<String>,
    pub prompts_dir: Option<String>,
    pub retry: Option<RetryFile>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryFile {
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub target_dir: PathBuf,
    pub max_iterations: u32,
    pub convergence: ConvergencePolicy,
    pub budgets: Budgets,
    pub max_plan_items: usize,
    pub max_lines_per_file: usize,
    pub inference: Backend,
    pub agent_binary: String,
    pub model: Option<String>,
    pub inference_timeout: Duration,
    pub analyzer_binary: String,
    pub test_binary: String,
    pub tool_timeout: Duration,
    pub log_path: PathBuf,
    pub prompts_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub report: Option<PathBuf>,
    pub verbose: bool,
}

impl Config {
    /// Load the config file (explicit `--config`, else `.refactor-swarm.toml` if present),
    /// then layer CLI flags on top.
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_config = match cli.config {
            Some(ref path) => {
                let path = Path::new(path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    parse_config(&std::fs::read_to_string(path)?)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        let config = merge(file_config, cli)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_max_iterations(self.max_iterations)?;
        check_window(self.convergence.stagnation_window)?;
        check_epsilon(self.convergence.epsilon)?;
        check_nonzero("max_issues", self.budgets.max_issues)?;
        check_nonzero("max_files", self.budgets.max_files)?;
        check_nonzero("max_plan_items", self.max_plan_items)?;
        check_nonzero("max_lines_per_file", self.max_lines_per_file)?;
        check_retry(
            self.retry.initial_backoff_ms,
            self.retry.max_backoff_ms,
        )
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if let Some(ref inference) = config.inference {
        parse_backend(inference)?;
    }
    if let Some(n) = config.max_iterations {
        check_max_iterations(n)?;
    }
    if let Some(k) = config.stagnation_window {
        check_window(k)?;
    }
    if let Some(eps) = config.epsilon {
        check_epsilon(eps)?;
    }
    for (name, value) in [
        ("max_issues", config.max_issues),
        ("max_files", config.max_files),
        ("max_plan_items", config.max_plan_items),
        ("max_lines_per_file", config.max_lines_per_file),
    ] {
        if let Some(v) = value {
            check_nonzero(name, v)?;
        }
    }
    for (name, value) in [
        ("inference_timeout", config.inference_timeout),
        ("tool_timeout", config.tool_timeout),
    ] {
        if value == Some(0) {
            return Err(Error::ConfigValidation(format!("{name} must be > 0")));
        }
    }
    if let Some(ref retry) = config.retry {
        let defaults = RetryPolicy::default();
        check_retry(
            retry.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            retry.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
        )?;
    }
    Ok(())
}

fn parse_backend(name: &str) -> Result<Backend> {
    Backend::parse(name).ok_or_else(|| {
        Error::ConfigValidation(format!(
            "unknown inference backend: {name} (expected: {})",
            Backend::ALL.join(", ")
        ))
    })
}

fn check_max_iterations(n: u32) -> Result<()> {
    if n == 0 {
        return Err(Error::ConfigValidation(
            "max_iterations must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn check_window(k: usize) -> Result<()> {
    if k < 2 {
        return Err(Error::ConfigValidation(
            "stagnation_window must be >= 2".to_string(),
        ));
    }
    Ok(())
}

fn check_epsilon(eps: f64) -> Result<()> {
    if !eps.is_finite() || eps <= 0.0 {
        return Err(Error::ConfigValidation(format!(
            "epsilon must be a positive finite number, got {eps}"
        )));
    }
    Ok(())
}

fn check_nonzero(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::ConfigValidation(format!("{name} must be > 0")));
    }
    Ok(())
}

fn check_retry(initial_backoff_ms: u64, max_backoff_ms: u64) -> Result<()> {
    if initial_backoff_ms > max_backoff_ms {
        return Err(Error::ConfigValidation(format!(
            "retry.initial_backoff_ms ({initial_backoff_ms}) exceeds retry.max_backoff_ms ({max_backoff_ms})"
        )));
    }
    Ok(())
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let inference = match cli.inference.as_deref().or(file.inference.as_deref()) {
        Some(name) => parse_backend(name)?,
        None => Backend::Claude,
    };
    let retry_file = file.retry.unwrap_or_default();
    let retry_defaults = RetryPolicy::default();

    Ok(Config {
        target_dir: PathBuf::from(&cli.target_dir),
        max_iterations: cli
            .max_iterations
            .or(file.max_iterations)
            .unwrap_or(DEFAULT_MAX_ITERATIONS),
        convergence: ConvergencePolicy {
            stagnation_window: cli
                .stagnation_window
                .or(file.stagnation_window)
                .unwrap_or(DEFAULT_STAGNATION_WINDOW),
            epsilon: cli.epsilon.or(file.epsilon).unwrap_or(DEFAULT_EPSILON),
        },
        budgets: Budgets {
            max_issues: cli
                .max_issues
                .or(file.max_issues)
                .unwrap_or(DEFAULT_MAX_ISSUES),
            max_files: cli.max_files.or(file.max_files).unwrap_or(DEFAULT_MAX_FILES),
        },
        max_plan_items: file.max_plan_items.unwrap_or(DEFAULT_MAX_PLAN_ITEMS),
        max_lines_per_file: file
            .max_lines_per_file
            .unwrap_or(DEFAULT_MAX_LINES_PER_FILE),
        inference,
        agent_binary: cli
            .agent_binary
            .clone()
            .or(file.agent_binary)
            .unwrap_or_else(|| inference.default_binary().to_string()),
        model: cli.model.clone().or(file.model),
        inference_timeout: Duration::from_secs(
            file.inference_timeout
                .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_SECS),
        ),
        analyzer_binary: file
            .analyzer_binary
            .unwrap_or_else(|| "pylint".to_string()),
        test_binary: file.test_binary.unwrap_or_else(|| "pytest".to_string()),
        tool_timeout: Duration::from_secs(file.tool_timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)),
        log_path: PathBuf::from(
            cli.log_path
                .clone()
                .or(file.log_path)
                .unwrap_or_else(|| DEFAULT_LOG_PATH.to_string()),
        ),
        prompts_dir: file.prompts_dir.map(PathBuf::from),
        retry: RetryPolicy {
            max_retries: retry_file.max_retries.unwrap_or(retry_defaults.max_retries),
            initial_backoff_ms: retry_file
                .initial_backoff_ms
                .unwrap_or(retry_defaults.initial_backoff_ms),
            max_backoff_ms: retry_file
                .max_backoff_ms
                .unwrap_or(retry_defaults.max_backoff_ms),
        },
        report: cli.report.as_ref().map(PathBuf::from),
        verbose: cli.verbose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;
    use serial_test::serial;
    use tempfile::TempDir;

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec!["refactor-swarm", "--target-dir", "./sandbox"];
        args.extend_from_slice(extra);
        Cli::parse_from(args)
    }

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
max_iterations = 5
stagnation_window = 4
epsilon = 0.05
max_issues = 20
inference = "gemini"
model = "gemini-2.5-pro"
log_path = "out/log.jsonl"

[retry]
max_retries = 2
initial_backoff_ms = 100
max_backoff_ms = 1000
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.max_iterations, Some(5));
        assert_eq!(config.epsilon, Some(0.05));
        assert_eq!(config.inference.as_deref(), Some("gemini"));
        assert_eq!(config.retry.unwrap().max_retries, Some(2));
    }

    #[test]
    fn test_parse_empty_config() {
        assert_eq!(parse_config("").unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_parse_invalid_backend() {
        let err = parse_config(r#"inference = "gpt""#).unwrap_err();
        assert!(err.to_string().contains("unknown inference backend"));
    }

    #[test]
    fn test_parse_zero_iterations() {
        let err = parse_config("max_iterations = 0").unwrap_err();
        assert!(err.to_string().contains("max_iterations must be > 0"));
    }

    #[test]
    fn test_parse_small_window() {
        let err = parse_config("stagnation_window = 1").unwrap_err();
        assert!(err.to_string().contains("stagnation_window"));
    }

    #[test]
    fn test_parse_bad_epsilon() {
        assert!(parse_config("epsilon = 0.0").is_err());
        assert!(parse_config("epsilon = -0.5").is_err());
        assert!(parse_config("epsilon = nan").is_err());
    }

    #[test]
    fn test_parse_zero_budget() {
        let err = parse_config("max_files = 0").unwrap_err();
        assert!(err.to_string().contains("max_files must be > 0"));
    }

    #[test]
    fn test_parse_inconsistent_retry() {
        let toml = "[retry]\ninitial_backoff_ms = 5000\nmax_backoff_ms = 10";
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = parse_config(r#"bogus = "value""#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
        assert!(parse_config("[retry]\njitter = true").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = ConfigFile {
            max_iterations: Some(7),
            epsilon: Some(0.2),
            max_files: Some(5),
            inference: Some("codex".to_string()),
            ..Default::default()
        };
        let config = merge(file, &cli(&["--max-iterations", "3", "--inference", "gemini"])).unwrap();
        assert_eq!(config.max_iterations, 3); // CLI wins
        assert_eq!(config.inference, Backend::Gemini); // CLI wins
        assert_eq!(config.convergence.epsilon, 0.2); // file value kept
        assert_eq!(config.budgets.max_files, 5); // file value kept
    }

    #[test]
    fn test_defaults_applied() {
        let config = merge(ConfigFile::default(), &cli(&[])).unwrap();
        assert_eq!(config.target_dir, PathBuf::from("./sandbox"));
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.convergence, ConvergencePolicy::default());
        assert_eq!(config.budgets.max_issues, 10);
        assert_eq!(config.budgets.max_files, 3);
        assert_eq!(config.inference, Backend::Claude);
        assert_eq!(config.agent_binary, "claude");
        assert_eq!(config.analyzer_binary, "pylint");
        assert_eq!(config.test_binary, "pytest");
        assert_eq!(config.log_path, PathBuf::from("logs/experiment_data.jsonl"));
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_agent_binary_follows_backend() {
        let config = merge(ConfigFile::default(), &cli(&["--inference", "codex"])).unwrap();
        assert_eq!(config.agent_binary, "codex");
    }

    #[test]
    fn test_cli_values_are_validated() {
        let config = merge(ConfigFile::default(), &cli(&["--epsilon=-1"])).unwrap();
        assert!(config.validate().is_err());
        let config = merge(ConfigFile::default(), &cli(&["--max-iterations", "0"])).unwrap();
        assert!(config.validate().is_err());
        assert!(merge(ConfigFile::default(), &cli(&["--inference", "gpt"])).is_err());
    }

    #[test]
    fn test_load_explicit_missing_config() {
        let err = Config::load(&cli(&["--config", "/definitely/missing.toml"])).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn test_load_explicit_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("swarm.toml");
        std::fs::write(&path, "max_iterations = 4\n").unwrap();
        let config = Config::load(&cli(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.max_iterations, 4);
    }

    #[test]
    #[serial]
    fn test_load_default_config_when_present() {
        let dir = TempDir::new().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let absent = Config::load(&cli(&[]));
        std::fs::write(DEFAULT_CONFIG_PATH, "max_iterations = 2\n").unwrap();
        let present = Config::load(&cli(&[]));

        std::env::set_current_dir(original).unwrap();
        assert_eq!(absent.unwrap().max_iterations, 10);
        assert_eq!(present.unwrap().max_iterations, 2);
    }
}
