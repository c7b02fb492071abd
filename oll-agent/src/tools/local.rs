use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};
use std::path::Path;

use super::ToolError;

/// Expands a leading `~` and `$VAR` / `${VAR}` references. Unset variables
/// expand to nothing.
pub fn expand_vars(input: &str) -> String {
    shellexpand::full_with_context_no_errors(
        input,
        || dirs::home_dir().map(|home| home.to_string_lossy().into_owned()),
        |name| Some(std::env::var(name).unwrap_or_default()),
    )
    .into_owned()
}

pub async fn run_executable(path: &Path, arguments: &Map<String, Value>) -> Result<String, ToolError> {
    let arg = serde_json::to_string(arguments)
        .map_err(|e| ToolError::InvalidArguments(format!("failed to marshal args: {}", e)))?;

    let output = tokio::process::Command::new(path)
        .arg(&arg)
        .output()
        .await
        .map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to run '{}' with args {}: {}", path.display(), arg, e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::ExecutionFailed(format!(
            "failed to run '{}' with args {}: {} {}",
            path.display(),
            arg,
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn go_style_to_jinja(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let (before, after) = rest.split_at(start + 2);
        out.push_str(before);

        let tail = after.trim_start_matches(|c: char| c == '-' || c.is_whitespace());
        out.push_str(&after[..after.len() - tail.len()]);

        rest = match tail.strip_prefix('.') {
            Some(stripped) if stripped.starts_with(|c: char| c.is_alphabetic() || c == '_') => stripped,
            _ => tail,
        };
    }
    out.push_str(rest);

    out
}

pub fn render_format(template: Option<&str>, arguments: &Map<String, Value>) -> Result<String, ToolError> {
    let Some(template) = template else {
        return serde_json::to_string_pretty(arguments)
            .map_err(|e| ToolError::Template(format!("failed to marshal to JSON: {}", e)));
    };

    let source = go_style_to_jinja(template);
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    let tpl = env
        .template_from_str(&source)
        .map_err(|e| ToolError::Template(format!("failed to parse format: {}", e)))?;
    tpl.render(arguments)
        .map_err(|e| ToolError::Template(format!("failed to execute template: {}", e)))
}
