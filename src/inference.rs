use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};

pub const GEMINI_API_KEY_ENV: &str = "GOOGLE_API_KEY";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Which generative backend produces plans and fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Claude,
    Codex,
    Gemini,
}

impl Backend {
    pub const ALL: &[&str] = &["claude", "codex", "gemini"];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "claude" => Some(Backend::Claude),
            "codex" => Some(Backend::Codex),
            "gemini" => Some(Backend::Gemini),
            _ => None,
        }
    }

    pub fn default_binary(self) -> &'static str {
        match self {
            Backend::Claude => "claude",
            Backend::Codex => "codex",
            Backend::Gemini => "",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Claude => write!(f, "claude"),
            Backend::Codex => write!(f, "codex"),
            Backend::Gemini => write!(f, "gemini"),
        }
    }
}

pub trait InferenceClient {
    /// Send one prompt and return the raw text the service produced.
    fn complete(&self, prompt: &str) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Model name recorded alongside each exchange in the phase log.
    fn model_name(&self) -> &str;
}

/// Invokes the claude CLI in print mode.
pub struct ClaudeClient {
    agent_binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
    working_dir: PathBuf,
}

impl ClaudeClient {
    pub fn new(
        agent_binary: String,
        model: Option<String>,
        timeout: Option<Duration>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            agent_binary,
            model,
            timeout,
            working_dir,
        }
    }

    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        (self.agent_binary.clone(), args)
    }
}

impl InferenceClient for ClaudeClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let (command, args) = self.build_command(prompt);
        let config = ProcessConfig {
            args,
            timeout: self.timeout,
            log_prefix: "inference:claude".to_string(),
            ..ProcessConfig::new(command, self.working_dir.clone())
        };
        run_agent(config).await
    }

    fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("claude")
    }
}

/// Invokes the codex CLI, feeding the prompt on stdin.
pub struct CodexClient {
    agent_binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
    working_dir: PathBuf,
}

impl CodexClient {
    pub fn new(
        agent_binary: String,
        model: Option<String>,
        timeout: Option<Duration>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            agent_binary,
            model,
            timeout,
            working_dir,
        }
    }

    pub fn build_command(&self) -> (String, Vec<String>) {
        let mut args = vec!["--quiet".to_string()];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        (self.agent_binary.clone(), args)
    }
}

impl InferenceClient for CodexClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let (command, args) = self.build_command();
        let config = ProcessConfig {
            args,
            timeout: self.timeout,
            log_prefix: "inference:codex".to_string(),
            stdin_data: Some(prompt.to_string()),
            ..ProcessConfig::new(command, self.working_dir.clone())
        };
        run_agent(config).await
    }

    fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("codex")
    }
}

async fn run_agent(config: ProcessConfig) -> Result<String> {
    let command = config.command.clone();
    let output = spawn_and_stream(config).await?;

    if let Some(sig) = output.signal {
        return Err(Error::Inference(format!("{command} killed by signal {sig}")));
    }
    if output.exit_code != 0 {
        return Err(Error::Inference(format!(
            "{command} exited with code {}: {}",
            output.exit_code,
            output.stderr()
        )));
    }

    let text = output.stdout();
    if text.trim().is_empty() {
        return Err(Error::Inference(format!("{command} produced no output")));
    }
    Ok(text)
}

/// Transport for the Gemini `generateContent` endpoint, split out for tests.
pub trait GeminiTransport: Send + Sync + 'static {
    fn generate(&self, model: &str, body: serde_json::Value) -> Result<serde_json::Value>;
}

struct HttpTransport {
    api_key: String,
    timeout: Option<Duration>,
}

impl GeminiTransport for HttpTransport {
    fn generate(&self, model: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{GEMINI_API_BASE}/{model}:generateContent");
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            let mut request = ureq::post(&url)
                .set("x-goog-api-key", &self.api_key)
                .set("Content-Type", "application/json");
            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }
            match request.send_json(&body) {
                Ok(response) => {
                    return response.into_json().map_err(|e| {
                        Error::Inference(format!("failed to parse Gemini response: {e}"))
                    });
                }
                Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms,
                        "retrying Gemini API after transient error"
                    );
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => {
                    return Err(Error::Inference(format!("Gemini request failed: {e}")));
                }
            }
        }
        Err(Error::Inference(format!(
            "Gemini request failed after {MAX_RETRIES} attempts"
        )))
    }
}

/// Only retry rate-limits (429), server errors (5xx), and transport errors.
fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

/// Calls the Gemini HTTP API on a blocking worker thread.
pub struct GeminiClient<T: GeminiTransport = Box<dyn GeminiTransport>> {
    transport: std::sync::Arc<T>,
    model: String,
}

impl GeminiTransport for Box<dyn GeminiTransport> {
    fn generate(&self, model: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        (**self).generate(model, body)
    }
}

impl GeminiClient {
    /// Build a client reading the key from `GOOGLE_API_KEY`.
    pub fn from_env(model: Option<String>, timeout: Option<Duration>) -> Result<Self> {
        let api_key = std::env::var(GEMINI_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                Error::Inference(format!("Gemini API key not found in ${GEMINI_API_KEY_ENV}"))
            })?;
        let transport: Box<dyn GeminiTransport> = Box::new(HttpTransport { api_key, timeout });
        Ok(Self::with_transport(transport, model))
    }
}

impl<T: GeminiTransport> GeminiClient<T> {
    pub fn with_transport(transport: T, model: Option<String>) -> Self {
        Self {
            transport: std::sync::Arc::new(transport),
            model: model.unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
        }
    }
}

impl<T: GeminiTransport> InferenceClient for GeminiClient<T> {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        let transport = std::sync::Arc::clone(&self.transport);
        let model = self.model.clone();
        debug!(model, chars = prompt.len(), "calling Gemini");
        let response = tokio::task::spawn_blocking(move || transport.generate(&model, body))
            .await
            .map_err(|e| Error::Inference(format!("Gemini worker failed: {e}")))??;
        extract_gemini_text(&response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Concatenate the text parts of the first candidate.
pub fn extract_gemini_text(response: &serde_json::Value) -> Result<String> {
    if let Some(error) = response.get("error") {
        return Err(Error::Inference(format!("Gemini API error: {error}")));
    }
    let parsed: GenerateResponse = serde_json::from_value(response.clone())
        .map_err(|e| Error::Inference(format!("unexpected Gemini response shape: {e}")))?;
    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::Inference("Gemini returned no candidates".to_string()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(Error::Inference(format!(
            "Gemini returned an empty response (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(text)
}

/// Enum dispatching to the configured backend.
pub enum AnyClient {
    Claude(ClaudeClient),
    Codex(CodexClient),
    Gemini(GeminiClient),
}

impl AnyClient {
    pub fn new(
        backend: Backend,
        agent_binary: String,
        model: Option<String>,
        timeout: Option<Duration>,
        working_dir: PathBuf,
    ) -> Result<Self> {
        Ok(match backend {
            Backend::Claude => {
                AnyClient::Claude(ClaudeClient::new(agent_binary, model, timeout, working_dir))
            }
            Backend::Codex => {
                AnyClient::Codex(CodexClient::new(agent_binary, model, timeout, working_dir))
            }
            Backend::Gemini => AnyClient::Gemini(GeminiClient::from_env(model, timeout)?),
        })
    }
}

impl InferenceClient for AnyClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        match self {
            AnyClient::Claude(c) => c.complete(prompt).await,
            AnyClient::Codex(c) => c.complete(prompt).await,
            AnyClient::Gemini(c) => c.complete(prompt).await,
        }
    }

    fn model_name(&self) -> &str {
        match self {
            AnyClient::Claude(c) => c.model_name(),
            AnyClient::Codex(c) => c.model_name(),
            AnyClient::Gemini(c) => c.model_name(),
        }
    }
}
