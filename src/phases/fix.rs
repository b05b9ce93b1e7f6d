use std::collections::HashMap;

use tracing::{debug, info};

use super::{FixOutput, FixPhase, FixRequest};
use crate::budget::truncate_lines;
use crate::error::Result;
use crate::experiment_log::Exchange;
use crate::inference::InferenceClient;
use crate::phases::audit::format_issues;
use crate::prompts::{PromptEngine, PromptKind};
use crate::sandbox::Sandbox;
use crate::schema::parse_changes;
use crate::state::VerificationResult;

/// Failures quoted back to the service from the previous test run.
const MAX_FEEDBACK_FAILURES: usize = 3;

/// Fix backed by the generative service.
pub struct InferenceFix<C> {
    client: C,
    prompts: PromptEngine,
    max_lines_per_file: usize,
}

impl<C: InferenceClient + Sync> InferenceFix<C> {
    pub fn new(client: C, prompts: PromptEngine, max_lines_per_file: usize) -> Self {
        Self {
            client,
            prompts,
            max_lines_per_file,
        }
    }

    fn render_prompt(&self, sandbox: &Sandbox, request: &FixRequest<'_>) -> Result<String> {
        let mut bodies = Vec::with_capacity(request.files.len());
        for file in request.files {
            let content = sandbox.read(file)?;
            bodies.push(format!(
                "### {file}\n```python\n{}\n```",
                truncate_lines(&content, self.max_lines_per_file)
            ));
        }

        let plan = request
            .report
            .plan
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {step}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars = HashMap::new();
        vars.insert("target".to_string(), sandbox.root().display().to_string());
        vars.insert("iteration".to_string(), request.iteration.to_string());
        vars.insert("file_count".to_string(), request.files.len().to_string());
        vars.insert("plan".to_string(), plan);
        vars.insert("issues".to_string(), format_issues(request.issues));
        vars.insert("feedback".to_string(), format_feedback(request.feedback));
        vars.insert("files".to_string(), bodies.join("\n\n"));
        self.prompts.render(PromptKind::Fix, &vars)
    }
}

impl<C: InferenceClient + Sync> FixPhase for InferenceFix<C> {
    async fn fix(&self, request: FixRequest<'_>) -> Result<FixOutput> {
        if request.files.is_empty() {
            debug!("no files selected, skipping fix");
            return Ok(FixOutput::default());
        }
        let sandbox = Sandbox::new(request.target)?;
        let prompt = self.render_prompt(&sandbox, &request)?;
        let answer = self.client.complete(&prompt).await?;
        let changes = parse_changes(&answer)?;
        info!(
            iteration = request.iteration,
            files = request.files.len(),
            changed = changes.len(),
            "fix proposed"
        );
        Ok(FixOutput {
            changes,
            exchange: Some(Exchange {
                model: self.client.model_name().to_string(),
                prompt,
                response: answer,
            }),
        })
    }
}

fn format_feedback(previous: Option<&VerificationResult>) -> String {
    let Some(result) = previous.filter(|r| !r.passed) else {
        return "None".to_string();
    };
    let mut lines: Vec<String> = result
        .failures
        .iter()
        .take(MAX_FEEDBACK_FAILURES)
        .map(|f| format!("- {}: {}", f.identifier, f.message))
        .collect();
    if result.failures.len() > MAX_FEEDBACK_FAILURES {
        lines.push(format!(
            "- ... and {} more",
            result.failures.len() - MAX_FEEDBACK_FAILURES
        ));
    }
    lines.join("\n")
}
