use clap::Parser;

/// refactor-swarm: audit, fix and test a Python codebase until it converges
#[derive(Parser, Debug, Clone)]
#[command(name = "refactor-swarm", version, about)]
pub struct Cli {
    /// Directory containing the code to refactor
    #[arg(long)]
    pub target_dir: String,

    /// Maximum number of Fix/Test iterations
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Path to config file (default: .refactor-swarm.toml if present)
    #[arg(long)]
    pub config: Option<String>,

    /// Number of trailing quality scores checked for stagnation
    #[arg(long)]
    pub stagnation_window: Option<usize>,

    /// Scores closer than this count as unchanged
    #[arg(long)]
    pub epsilon: Option<f64>,

    /// Maximum issues forwarded to the generative service
    #[arg(long)]
    pub max_issues: Option<usize>,

    /// Maximum files rewritten per iteration
    #[arg(long)]
    pub max_files: Option<usize>,

    /// Generative backend to use (claude, codex, gemini)
    #[arg(long)]
    pub inference: Option<String>,

    /// Agent binary for CLI backends (default: backend name)
    #[arg(long)]
    pub agent_binary: Option<String>,

    /// Model for the generative backend
    #[arg(long)]
    pub model: Option<String>,

    /// Phase log location (JSON lines)
    #[arg(long)]
    pub log_path: Option<String>,

    /// Write the final run state as JSON to this path
    #[arg(long)]
    pub report: Option<String>,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let cli = Cli::parse_from(["refactor-swarm", "--target-dir", "./sandbox"]);
        assert_eq!(cli.target_dir, "./sandbox");
        assert!(cli.max_iterations.is_none());
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_target_dir_required() {
        assert!(Cli::try_parse_from(["refactor-swarm"]).is_err());
    }

    #[test]
    fn test_parse_all_overrides() {
        let cli = Cli::parse_from([
            "refactor-swarm",
            "--target-dir",
            "/work/src",
            "--max-iterations",
            "3",
            "--config",
            "custom.toml",
            "--stagnation-window",
            "4",
            "--epsilon",
            "0.05",
            "--max-issues",
            "12",
            "--max-files",
            "2",
            "--inference",
            "gemini",
            "--agent-binary",
            "/opt/claude",
            "--model",
            "gemini-2.5-pro",
            "--log-path",
            "/tmp/log.jsonl",
            "--report",
            "/tmp/report.json",
            "-v",
        ]);
        assert_eq!(cli.max_iterations, Some(3));
        assert_eq!(cli.config.as_deref(), Some("custom.toml"));
        assert_eq!(cli.stagnation_window, Some(4));
        assert_eq!(cli.epsilon, Some(0.05));
        assert_eq!(cli.max_issues, Some(12));
        assert_eq!(cli.max_files, Some(2));
        assert_eq!(cli.inference.as_deref(), Some("gemini"));
        assert_eq!(cli.agent_binary.as_deref(), Some("/opt/claude"));
        assert_eq!(cli.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(cli.log_path.as_deref(), Some("/tmp/log.jsonl"));
        assert_eq!(cli.report.as_deref(), Some("/tmp/report.json"));
        assert!(cli.verbose);
    }

    #[test]
    fn test_rejects_non_numeric_iterations() {
        assert!(
            Cli::try_parse_from(["refactor-swarm", "--target-dir", ".", "--max-iterations", "lots"])
                .is_err()
        );
    }
}
