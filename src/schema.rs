use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::state::ChangeSet;

/// Plan used when the service's answer contains nothing recognisable.
pub const FALLBACK_PLAN_ITEM: &str = "Fix all detected issues";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanOutput {
    Wrapped { plan: Vec<PlanItem> },
    Bare(Vec<PlanItem>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanItem {
    Text(String),
    Detailed {
        description: String,
        #[serde(default)]
        file: Option<String>,
    },
}

impl PlanItem {
    fn into_text(self) -> String {
        match self {
            PlanItem::Text(s) => s,
            PlanItem::Detailed {
                description,
                file: Some(file),
            } => format!("{file}: {description}"),
            PlanItem::Detailed { description, .. } => description,
        }
    }
}

/// Parse the audit service's plan.
///
/// Accepts `{"plan": [...]}`, a bare JSON array (of strings or of objects with a
/// `description`), fenced JSON, and finally numbered or bulleted lines. Never
/// returns an empty plan.
pub fn parse_plan(raw: &str, max_items: usize) -> Vec<String> {
    let mut items: Vec<String> = match decode_json::<PlanOutput>(raw) {
        Ok(PlanOutput::Wrapped { plan }) | Ok(PlanOutput::Bare(plan)) => {
            plan.into_iter().map(PlanItem::into_text).collect()
        }
        Err(_) => plan_from_lines(&strip_markdown_fences(raw)),
    };
    items.retain(|s| !s.trim().is_empty());
    items.truncate(max_items);
    if items.is_empty() {
        vec![FALLBACK_PLAN_ITEM.to_string()]
    } else {
        items
    }
}

fn plan_from_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let stripped = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| strip_number_prefix(line))?;
            Some(stripped.trim().to_string())
        })
        .collect()
}

/// `"3. Fix x"` or `"3) Fix x"` -> `"Fix x"`.
fn strip_number_prefix(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
}

#[derive(Debug, Deserialize)]
struct ChangesOutput {
    #[serde(alias = "files")]
    changes: Vec<FileChange>,
}

#[derive(Debug, Deserialize)]
struct FileChange {
    #[serde(alias = "file")]
    path: String,
    content: String,
}

/// Parse the fix service's `{"changes": [{"path", "content"}]}` answer.
///
/// Paths are not checked here; the sandbox does that before anything is written.
pub fn parse_changes(raw: &str) -> Result<ChangeSet> {
    let output: ChangesOutput = decode_json(raw)
        .map_err(|e| Error::Validation(format!("failed to parse fix output JSON: {e}")))?;

    let mut changes = ChangeSet::new();
    for change in output.changes {
        if change.path.trim().is_empty() {
            return Err(Error::Validation("fix output contains an empty path".to_string()));
        }
        if changes.insert(change.path.clone(), change.content).is_some() {
            return Err(Error::Validation(format!(
                "fix output changes {} more than once",
                change.path
            )));
        }
    }
    Ok(changes)
}

/// Decode the whole answer as JSON first; only unwrap a code fence when that
/// fails, so fences inside string values are left alone.
fn decode_json<T: DeserializeOwned>(raw: &str) -> serde_json::Result<T> {
    let trimmed = raw.trim();
    serde_json::from_str(trimmed).or_else(|err| {
        let body = strip_markdown_fences(trimmed);
        if body == trimmed {
            Err(err)
        } else {
            serde_json::from_str(&body)
        }
    })
}

/// Remove markdown code fences from a string, returning the inner content.
/// Handles ` ```json `, ` ``` `, prose before the fence, and bare JSON.
pub fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let rest = &trimmed[start + 3..];

    // Skip the optional language tag on the opening fence line
    let Some(pos) = rest.find('\n') else {
        return String::new();
    };
    let after_tag = &rest[pos + 1..];

    if let Some(end) = after_tag.rfind("```") {
        return after_tag[..end].trim().to_string();
    }
    after_tag.trim().to_string()
}
