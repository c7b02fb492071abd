mod local;

pub use local::{expand_vars, render_format, run_executable};

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

use crate::clients::ToolDefinition;
use crate::config::from_jsonc;
use crate::mcp::RemoteTool;

pub const CALLBACK_STDIN: &str = "@stdin";
pub const CALLBACK_FORMAT: &str = "@format";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Template error: {0}")]
    Template(String),
    #[error("Invalid tool declarations: {0}")]
    InvalidDeclarations(String),
    #[error("Duplicate tool names: {0}")]
    DuplicateName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalCallback {
    Executable(PathBuf),
    Stdin,
    Format(Option<String>),
}

impl LocalCallback {
    pub fn parse(spec: &str) -> Self {
        if spec == CALLBACK_STDIN {
            return LocalCallback::Stdin;
        }
        if let Some(rest) = spec.strip_prefix(CALLBACK_FORMAT) {
            if rest.is_empty() {
                return LocalCallback::Format(None);
            }
            if let Some(template) = rest.strip_prefix('=') {
                return LocalCallback::Format(Some(template.to_string()));
            }
        }
        LocalCallback::Executable(PathBuf::from(expand_vars(spec)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Local(LocalCallback),
    Remote { server_key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub destructive: bool,
    pub backend: Backend,
}

impl ToolDescriptor {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(&self.name, &self.description, self.parameters.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    Local {
        descriptor: &'a ToolDescriptor,
        callback: &'a LocalCallback,
        confirm: bool,
    },
    Remote {
        descriptor: &'a ToolDescriptor,
        server_key: &'a str,
    },
    NotFound,
}

pub fn parse_declarations(json: &str) -> Result<Vec<ToolDefinition>, ToolError> {
    from_jsonc(json).map_err(ToolError::InvalidDeclarations)
}

/// Maps tool names to backends. Names are unique across the local
/// declarations and every registered server.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    local: Vec<ToolDefinition>,
    local_descriptors: HashMap<String, ToolDescriptor>,
    confirm: HashMap<String, bool>,
    remote: Vec<ToolDescriptor>,
    names: HashSet<String>,
}

impl ToolRegistry {
    pub fn new(
        local: Vec<ToolDefinition>,
        callbacks: &HashMap<String, String>,
        confirm: HashMap<String, bool>,
    ) -> Result<Self, ToolError> {
        let mut names = HashSet::new();
        let mut duplicates = Vec::new();
        for declaration in &local {
            if !names.insert(declaration.name().to_string()) {
                duplicates.push(declaration.name().to_string());
            }
        }
        if !duplicates.is_empty() {
            return Err(ToolError::DuplicateName(duplicates.join(", ")));
        }

        for name in callbacks.keys() {
            if !names.contains(name) {
                tracing::warn!("callback for undeclared tool '{}' is ignored", name);
            }
        }

        let local_descriptors = local
            .iter()
            .filter_map(|declaration| {
                let spec = callbacks.get(declaration.name())?;
                Some((
                    declaration.name().to_string(),
                    ToolDescriptor {
                        name: declaration.name().to_string(),
                        description: declaration.function.description.clone(),
                        parameters: declaration.function.parameters.clone(),
                        destructive: false,
                        backend: Backend::Local(LocalCallback::parse(spec)),
                    },
                ))
            })
            .collect();

        Ok(Self {
            local,
            local_descriptors,
            confirm,
            remote: Vec::new(),
            names,
        })
    }

    pub fn register_remote(&mut self, server_key: &str, tools: Vec<RemoteTool>) -> Result<(), ToolError> {
        let mut duplicates = Vec::new();
        let mut seen = HashSet::new();
        for tool in &tools {
            if self.names.contains(&tool.name) || !seen.insert(tool.name.as_str()) {
                duplicates.push(tool.name.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(ToolError::DuplicateName(duplicates.join(", ")));
        }

        for tool in tools {
            tracing::debug!("registering tool '{}' from '{}'", tool.name, server_key);
            self.names.insert(tool.name.clone());
            self.remote.push(ToolDescriptor {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
                destructive: tool.destructive.unwrap_or(false),
                backend: Backend::Remote {
                    server_key: server_key.to_string(),
                },
            });
        }

        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Resolution<'_> {
        let descriptor = self
            .local_descriptors
            .get(name)
            .or_else(|| self.remote.iter().find(|descriptor| descriptor.name == name));

        match descriptor {
            Some(descriptor) => match &descriptor.backend {
                Backend::Local(callback) => Resolution::Local {
                    descriptor,
                    callback,
                    confirm: self.confirm.get(name).copied().unwrap_or(false),
                },
                Backend::Remote { server_key } => Resolution::Remote {
                    descriptor,
                    server_key,
                },
            },
            None => Resolution::NotFound,
        }
    }

    pub fn declarations(&self) -> Vec<ToolDefinition> {
        self.local
            .iter()
            .cloned()
            .chain(self.remote.iter().map(ToolDescriptor::definition))
            .collect()
    }
}
