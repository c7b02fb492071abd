use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::APP_NAME;
use crate::history::Turn;

pub const FILES_TAG_BEGIN: &str = "<files>";
pub const FILES_TAG_END: &str = "</files>";

const IGNORED_DIRS: &[&str] = &[
    ".cache",
    ".config",
    ".git",
    ".ssh",
    ".svn",
    ".Trash",
    ".venv",
    "build",
    "dist",
    "node_modules",
    "target",
    "tmp",
];
const IGNORED_FILES: &[&str] = &[
    ".DS_Store",
    ".env",
    ".env.local",
    "config.json",
    "config.toml",
    "config.yaml",
    "config.yml",
    "Thumbs.db",
];

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported file type: {0}")]
    Unsupported(PathBuf),
}

pub fn default_system_instruction(model: &str) -> String {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
    format!(
        r#"You are a CLI named '{app}' which uses (s)LLM model '{model}'.

Current datetime is {now}.

Respond to user messages according to the following principles:
- Do not repeat the user's request and return only the response to the user's request.
- Unless otherwise specified, respond in the same language as used in the user's request.
- Be as accurate as possible.
- Be as truthful as possible.
- Be as comprehensive and informative as possible.
- When textual files are provided for context, they will be listed between the '{begin}{end}' tags in the prompt, so make sure to use them if provided.
"#,
        app = APP_NAME,
        model = model,
        now = now,
        begin = FILES_TAG_BEGIN,
        end = FILES_TAG_END,
    )
}

pub fn merge_stdin(stdin: Option<String>, prompt: Option<String>) -> Option<String> {
    let stdin = stdin.filter(|s| !s.trim().is_empty());
    match (stdin, prompt) {
        (Some(stdin), Some(prompt)) => Some(format!("{}\n\n{}", stdin.trim_end(), prompt)),
        (Some(stdin), None) => Some(stdin),
        (None, prompt) => prompt,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attachment {
    Image,
    Text,
}

fn classify(bytes: &[u8]) -> Option<Attachment> {
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
    const JPEG: &[u8] = b"\xff\xd8\xff";

    let image = bytes.starts_with(PNG)
        || bytes.starts_with(JPEG)
        || bytes.starts_with(b"GIF87a")
        || bytes.starts_with(b"GIF89a")
        || (bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP");
    if image {
        return Some(Attachment::Image);
    }

    match std::str::from_utf8(bytes) {
        Ok(text) if !text.contains('\0') => Some(Attachment::Text),
        _ => None,
    }
}

fn ignored(path: &Path, is_dir: bool) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if is_dir {
        IGNORED_DIRS.contains(&name)
    } else {
        IGNORED_FILES.contains(&name)
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> PromptError {
    PromptError::Io {
        path: err.path().unwrap_or(root).to_path_buf(),
        source: err.into(),
    }
}

/// Expands directories into the files below them, skipping ignored and empty
/// entries. Duplicates are dropped, first occurrence wins.
pub fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>, PromptError> {
    let mut files = Vec::new();
    let mut seen = HashSet::new();

    for root in paths {
        let walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let skip = entry.depth() > 0 && entry.file_type().is_dir() && ignored(entry.path(), true);
                if skip {
                    tracing::info!(path = %entry.path().display(), "ignoring directory");
                }
                !skip
            });

        for entry in walker {
            let entry = entry.map_err(|e| walk_error(root, e))?;
            if entry.file_type().is_dir() {
                continue;
            }

            let path = entry.path();
            let len = entry.metadata().map_err(|e| walk_error(root, e))?.len();
            if len == 0 {
                tracing::info!(path = %path.display(), "ignoring empty file");
            } else if ignored(path, false) {
                tracing::info!(path = %path.display(), "ignoring file");
            } else if seen.insert(path.to_path_buf()) {
                files.push(entry.into_path());
            }
        }
    }

    Ok(files)
}

pub async fn build_user_turn(prompt: &str, paths: &[PathBuf]) -> Result<Turn, PromptError> {
    let mut images = Vec::new();
    let mut contexts = Vec::new();

    for path in expand_paths(paths)? {
        let bytes = tokio::fs::read(&path).await.map_err(|source| PromptError::Io {
            path: path.clone(),
            source,
        })?;

        match classify(&bytes) {
            Some(Attachment::Image) => images.push(STANDARD.encode(&bytes)),
            Some(Attachment::Text) => {
                let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                contexts.push(format!(
                    "<file name=\"{}\">\n{}\n</file>",
                    name,
                    String::from_utf8_lossy(&bytes)
                ));
            }
            None => return Err(PromptError::Unsupported(path)),
        }
    }

    let text = if contexts.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n{}\n{}\n\n{}", FILES_TAG_BEGIN, contexts.join("\n"), FILES_TAG_END, prompt)
    };

    Ok(Turn::user(text).with_images(images))
}
