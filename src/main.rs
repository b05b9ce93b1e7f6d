use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use refactor_swarm::analyzer::Pylint;
use refactor_swarm::cli::Cli;
use refactor_swarm::config::Config;
use refactor_swarm::error::{Error, FailureKind, Result};
use refactor_swarm::experiment_log::ExperimentLog;
use refactor_swarm::inference::AnyClient;
use refactor_swarm::orchestrator::{Orchestrator, Settings};
use refactor_swarm::phases::{InferenceFix, LintAudit, PytestVerify};
use refactor_swarm::prompts::PromptEngine;
use refactor_swarm::pytest::Pytest;
use refactor_swarm::state::{RunState, TerminalReason};

const EXIT_FATAL: i32 = 1;
const EXIT_MAX_ITERATIONS: i32 = 2;
const EXIT_STAGNATION: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .init();
}

fn exit_code(state: &RunState) -> i32 {
    let reason = state.terminal_reason();
    if reason.is_success() {
        return 0;
    }
    if state
        .failure()
        .is_some_and(|f| f.kind == FailureKind::Interrupted)
    {
        return EXIT_INTERRUPTED;
    }
    match reason {
        TerminalReason::MaxIterations => EXIT_MAX_ITERATIONS,
        TerminalReason::Stagnation => EXIT_STAGNATION,
        _ => EXIT_FATAL,
    }
}

fn write_report(path: &std::path::Path, state: &RunState) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::State(format!("failed to encode run report: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}

fn print_summary(state: &RunState) {
    let score = |s: Option<f64>| s.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"));
    eprintln!("[refactor-swarm] Result: {}", state.terminal_reason());
    eprintln!(
        "[refactor-swarm] Iterations: {}/{}",
        state.iteration(),
        state.max_iterations()
    );
    eprintln!(
        "[refactor-swarm] Quality: {} -> {}",
        score(state.initial_quality_score()),
        score(state.final_quality_score())
    );
    if let Some(finished) = state.finished_at() {
        eprintln!(
            "[refactor-swarm] Elapsed: {}s",
            finished.saturating_sub(state.started_at())
        );
    }
    if let Some(failure) = state.failure() {
        eprintln!(
            "[refactor-swarm] Failed in {} phase: {}",
            failure.phase, failure.message
        );
    }
}

async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<RunState> {
    let prompts = PromptEngine::new(config.prompts_dir.clone());
    let tool_timeout = Some(config.tool_timeout);
    let working_dir = std::env::current_dir()?;
    let client = || {
        AnyClient::new(
            config.inference,
            config.agent_binary.clone(),
            config.model.clone(),
            Some(config.inference_timeout),
            working_dir.clone(),
        )
    };

    let audit = LintAudit::new(
        Pylint::new(config.analyzer_binary.clone(), tool_timeout),
        client()?,
        prompts.clone(),
        config.budgets.max_issues,
        config.max_plan_items,
    );
    let fix = InferenceFix::new(client()?, prompts, config.max_lines_per_file);
    let test = PytestVerify::new(
        Pytest::new(config.test_binary.clone(), tool_timeout),
        Pylint::new(config.analyzer_binary.clone(), tool_timeout),
    );
    let settings = Settings {
        convergence: config.convergence,
        budgets: config.budgets,
        retry: config.retry,
    };
    let log = ExperimentLog::new(&config.log_path);
    info!(path = %log.path().display(), "phase log");
    let orchestrator =
        Orchestrator::with_recorder(audit, fix, test, settings, log).with_shutdown(shutdown);

    let state = orchestrator
        .run(config.target_dir.clone(), config.max_iterations)
        .await;

    if let Some(ref path) = config.report {
        write_report(path, &state)?;
        info!(path = %path.display(), "run report written");
    }
    Ok(state)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_FATAL);
        }
    };
    info!(target_dir = %config.target_dir.display(), inference = %config.inference, "refactor-swarm starting");

    // Ctrl-C ends the run through the orchestrator so the report and the
    // final log entries are still written.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping run");
            let _ = shutdown_tx.send(true);
        }
    });

    match run(config, shutdown_rx).await {
        Ok(state) => {
            print_summary(&state);
            std::process::exit(exit_code(&state));
        }
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("error: {e}");
            std::process::exit(EXIT_FATAL);
        }
    }
}
