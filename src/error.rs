use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("sandbox violation: {0}")]
    Sandbox(String),

    #[error("static analyzer error: {0}")]
    Analyzer(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("test runner error: {0}")]
    TestRunner(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("phase log error: {0}")]
    PhaseLog(String),

    #[error("state error: {0}")]
    State(String),

    #[error("interrupted")]
    Interrupted,
}

/// How a phase failure is reported on the final run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Phase output was malformed or escaped the target.
    Validation,
    /// An external tool or service failed.
    Collaborator,
    /// Local I/O, configuration or bookkeeping failure.
    Internal,
    /// The user interrupted a running collaborator.
    Interrupted,
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Validation(_) | Error::Sandbox(_) => FailureKind::Validation,
            Error::Analyzer(_)
            | Error::Inference(_)
            | Error::TestRunner(_)
            | Error::Process(_) => FailureKind::Collaborator,
            Error::Interrupted => FailureKind::Interrupted,
            _ => FailureKind::Internal,
        }
    }

    /// Only collaborator failures are candidates for the retry policy.
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Collaborator
    }
}

pub type Result<T> = std::result::Result<T, Error>;
