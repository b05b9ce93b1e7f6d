use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::info;

use super::{AuditOutput, AuditPhase};
use crate::analyzer::StaticAnalyzer;
use crate::budget::select_issue_subset;
use crate::error::{Error, Result};
use crate::experiment_log::Exchange;
use crate::inference::InferenceClient;
use crate::prompts::{PromptEngine, PromptKind};
use crate::sandbox::Sandbox;
use crate::schema::parse_plan;
use crate::state::Issue;

/// Audit backed by a static analyzer, with the plan written by the generative service.
pub struct LintAudit<A, C> {
    analyzer: A,
    client: C,
    prompts: PromptEngine,
    max_issues: usize,
    max_plan_items: usize,
}

impl<A: StaticAnalyzer + Sync, C: InferenceClient + Sync> LintAudit<A, C> {
    pub fn new(
        analyzer: A,
        client: C,
        prompts: PromptEngine,
        max_issues: usize,
        max_plan_items: usize,
    ) -> Self {
        Self {
            analyzer,
            client,
            prompts,
            max_issues,
            max_plan_items,
        }
    }

    fn render_prompt(&self, target: &Path, score: f64, issues: &[Issue]) -> Result<String> {
        let top = select_issue_subset(issues, self.max_issues);
        let mut vars = HashMap::new();
        vars.insert("target".to_string(), target.display().to_string());
        vars.insert("quality_score".to_string(), format!("{score:.2}"));
        vars.insert("issue_count".to_string(), issues.len().to_string());
        vars.insert("issues".to_string(), format_issues(&top));
        vars.insert("max_plan_items".to_string(), self.max_plan_items.to_string());
        self.prompts.render(PromptKind::Audit, &vars)
    }
}

impl<A: StaticAnalyzer + Sync, C: InferenceClient + Sync> AuditPhase for LintAudit<A, C> {
    async fn audit(&self, target: &Path) -> Result<AuditOutput> {
        let sandbox = Sandbox::new(target)?;
        let files = sandbox.list_files("py")?;
        if files.is_empty() {
            return Err(Error::Validation(format!(
                "no Python files under {}",
                sandbox.root().display()
            )));
        }

        let analysis = self.analyzer.analyze(sandbox.root(), &files).await?;
        let candidate_files = candidates(&files, &analysis.issues);

        let prompt = self.render_prompt(sandbox.root(), analysis.quality_score, &analysis.issues)?;
        let answer = self.client.complete(&prompt).await?;
        let plan = parse_plan(&answer, self.max_plan_items);

        info!(
            scanned = files.len(),
            candidates = candidate_files.len(),
            issues = analysis.issues.len(),
            plan_steps = plan.len(),
            "audit complete"
        );
        Ok(AuditOutput {
            quality_score: analysis.quality_score,
            issues: analysis.issues,
            candidate_files,
            plan,
            exchange: Some(Exchange {
                model: self.client.model_name().to_string(),
                prompt,
                response: answer,
            }),
        })
    }
}

/// Scanned files that carry at least one issue, in scan order; all files when none do.
fn candidates(files: &[String], issues: &[Issue]) -> Vec<String> {
    let flagged: BTreeSet<&str> = issues.iter().map(|i| i.location.file.as_str()).collect();
    let with_issues: Vec<String> = files
        .iter()
        .filter(|f| flagged.contains(f.as_str()))
        .cloned()
        .collect();
    if with_issues.is_empty() {
        files.to_vec()
    } else {
        with_issues
    }
}

/// One `- [severity] file:line message` bullet per issue.
pub fn format_issues(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "None".to_string();
    }
    issues
        .iter()
        .map(|i| format!("- [{}] {} {}", i.severity, i.location, i.message))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analysis;
    use crate::state::{IssueLocation, Severity};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FixedAnalyzer(Analysis);

    impl StaticAnalyzer for FixedAnalyzer {
        async fn analyze(&self, _root: &Path, _files: &[String]) -> Result<Analysis> {
            Ok(self.0.clone())
        }
    }

    struct CannedClient {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    impl InferenceClient for CannedClient {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.answer.clone())
        }

        fn model_name(&self) -> &str {
            "canned-model"
        }
    }

    fn issue(file: &str, severity: Severity) -> Issue {
        Issue {
            location: IssueLocation {
                file: file.to_string(),
                line: 1,
            },
            severity,
            message: "undefined-variable (E0602): Undefined variable 'z'".to_string(),
        }
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.py"), "y = z\n").unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        fs::create_dir(dir.path().join("__pycache__")).unwrap();
        fs::write(dir.path().join("__pycache__/a.py"), "").unwrap();
        dir
    }

    fn audit(issues: Vec<Issue>, answer: &str) -> LintAudit<FixedAnalyzer, CannedClient> {
        LintAudit::new(
            FixedAnalyzer(Analysis {
                quality_score: 6.5,
                issues,
            }),
            CannedClient {
                answer: answer.to_string(),
                prompts: Mutex::new(Vec::new()),
            },
            PromptEngine::default(),
            10,
            8,
        )
    }

    #[tokio::test]
    async fn test_audit_selects_files_with_issues() {
        let dir = project();
        let phase = audit(
            vec![issue("b.py", Severity::Error)],
            r#"{"plan": ["Define z in b.py"]}"#,
        );
        let output = phase.audit(dir.path()).await.unwrap();
        assert_eq!(output.quality_score, 6.5);
        assert_eq!(output.candidate_files, vec!["b.py"]);
        assert_eq!(output.plan, vec!["Define z in b.py"]);

        let exchange = output.exchange.as_ref().unwrap();
        assert_eq!(exchange.model, "canned-model");
        assert_eq!(exchange.response, r#"{"plan": ["Define z in b.py"]}"#);

        let prompts = phase.client.prompts.lock().unwrap();
        assert_eq!(exchange.prompt, prompts[0]);
        assert!(prompts[0].contains("- [error] b.py:1 undefined-variable"));
        assert!(prompts[0].contains("6.50/10"));
    }

    #[tokio::test]
    async fn test_audit_without_issues_keeps_all_files() {
        let dir = project();
        let phase = audit(vec![], "NO_CHANGES");
        let output = phase.audit(dir.path()).await.unwrap();
        assert_eq!(output.candidate_files, vec!["a.py", "b.py"]);
        assert_eq!(output.plan, vec![crate::schema::FALLBACK_PLAN_ITEM]);
    }

    #[tokio::test]
    async fn test_audit_is_deterministic() {
        let dir = project();
        let phase = audit(vec![issue("a.py", Severity::Info)], "[]");
        let first = phase.audit(dir.path()).await.unwrap();
        let second = phase.audit(dir.path()).await.unwrap();
        assert_eq!(first.candidate_files, second.candidate_files);
    }

    #[tokio::test]
    async fn test_audit_rejects_empty_project() {
        let dir = TempDir::new().unwrap();
        let err = audit(vec![], "[]").audit(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("no Python files"));
    }

    #[test]
    fn test_format_issues() {
        assert_eq!(format_issues(&[]), "None");
        let text = format_issues(&[issue("a.py", Severity::Critical)]);
        assert!(text.starts_with("- [critical] a.py:1 "));
    }
}
