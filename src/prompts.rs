use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const DEFAULT_AUDIT: &str = include_str!("default_prompts/audit-plan.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/fix-files.md");

/// Known template variable names for validation.
const KNOWN_VARIABLES: &[&str] = &[
    "target",
    "quality_score",
    "issue_count",
    "issues",
    "max_plan_items",
    "iteration",
    "plan",
    "feedback",
    "files",
    "file_count",
];

/// The prompts sent to the generative service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Audit,
    Fix,
}

impl PromptKind {
    fn default_template(self) -> &'static str {
        match self {
            PromptKind::Audit => DEFAULT_AUDIT,
            PromptKind::Fix => DEFAULT_FIX,
        }
    }

    fn filename(self) -> &'static str {
        match self {
            PromptKind::Audit => "audit-plan.md",
            PromptKind::Fix => "fix-files.md",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptKind::Audit => write!(f, "audit"),
            PromptKind::Fix => write!(f, "fix"),
        }
    }
}

/// Prompt template engine with default templates and user overrides.
#[derive(Debug, Clone, Default)]
pub struct PromptEngine {
    override_dir: Option<PathBuf>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self { override_dir }
    }

    /// Load a prompt template, preferring `<override_dir>/<kind file>` over the embedded default.
    pub fn load_template(&self, kind: PromptKind) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = Path::new(dir).join(kind.filename());
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }
        Ok(kind.default_template().to_string())
    }

    pub fn render(&self, kind: PromptKind, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(kind)?;
        render_template(&template, vars)
    }
}

/// Render a template string by substituting `{{variable}}` placeholders.
/// Errors on unknown variables (strict mode).
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            let mut found_close = false;

            while let Some(c2) = chars.next() {
                if c2 == '}' && chars.peek() == Some(&'}') {
                    chars.next();
                    found_close = true;
                    break;
                }
                var_name.push(c2);
            }

            if !found_close {
                return Err(Error::Prompt(format!(
                    "unclosed template variable: {{{{{var_name}"
                )));
            }

            let var_name = var_name.trim();
            if !KNOWN_VARIABLES.contains(&var_name) {
                return Err(Error::Prompt(format!(
                    "unknown template variable: {var_name}"
                )));
            }

            match vars.get(var_name) {
                Some(value) => result.push_str(value),
                None => {
                    return Err(Error::Prompt(format!(
                        "missing value for template variable: {var_name}"
                    )));
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}
