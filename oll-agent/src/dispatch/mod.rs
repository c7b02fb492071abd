use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::clients::ToolCall;
use crate::history::History;
use crate::mcp::{MCPError, ToolSession};
use crate::output::{Operator, Transcript, Verbosity};
use crate::tools::{LocalCallback, Resolution, ToolError, ToolRegistry, render_format, run_executable};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("tool callback failed: {0}")]
    Local(#[from] ToolError),
    #[error("failed to call MCP tool: {0}")]
    Remote(#[from] MCPError),
    #[error("failed to read answer: {0}")]
    Stdin(#[from] std::io::Error),
    #[error("possible infinite loop detected: '{0}'")]
    LoopDetected(String),
    #[error("no open session for tool '{0}'")]
    MissingSession(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    pub force_destructive: bool,
    pub show_results: bool,
    pub recurse: bool,
}

pub fn result_turn(signature: &str, text: &str) -> String {
    format!("Result of function '{}': {}", signature, text)
}

pub fn decline_turn(signature: &str) -> String {
    format!("User chose not to call function '{}'.", signature)
}

fn remote_result_text(content: &Value) -> String {
    let texts: Option<Vec<&str>> = content.as_array().and_then(|items| {
        items
            .iter()
            .map(|item| match item.get("type").and_then(Value::as_str) {
                Some("text") => item.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect()
    });

    match texts {
        Some(texts) if !texts.is_empty() => texts.join("\n"),
        _ => serde_json::to_string_pretty(content).unwrap_or_else(|_| content.to_string()),
    }
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    sessions: HashMap<String, Arc<dyn ToolSession>>,
    operator: Arc<dyn Operator>,
    options: DispatchOptions,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sessions: &[Arc<dyn ToolSession>],
        operator: Arc<dyn Operator>,
        options: DispatchOptions,
    ) -> Self {
        let sessions = sessions
            .iter()
            .map(|session| (session.server_key().to_string(), Arc::clone(session)))
            .collect();

        Self {
            registry,
            sessions,
            operator,
            options,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        call: &ToolCall,
        history: &mut History,
        transcript: &mut Transcript,
    ) -> Result<(), DispatchError> {
        let signature = call.signature();
        tracing::debug!(tool = call.name(), "dispatching {}", signature);

        match self.registry.resolve(call.name()) {
            Resolution::Local { callback, confirm, .. } => {
                self.dispatch_local(call, &signature, callback, confirm, history, transcript)
                    .await
            }
            Resolution::Remote {
                descriptor,
                server_key,
            } => {
                self.dispatch_remote(call, &signature, server_key, descriptor.destructive, history, transcript)
                    .await
            }
            Resolution::NotFound => {
                let unhandled = format!("Generated tool call: {}", signature);
                transcript.ensure_newline();
                transcript.notice(&unhandled);
                history.append_user(unhandled);
                Ok(())
            }
        }
    }

    async fn dispatch_local(
        &self,
        call: &ToolCall,
        signature: &str,
        callback: &LocalCallback,
        confirm: bool,
        history: &mut History,
        transcript: &mut Transcript,
    ) -> Result<(), DispatchError> {
        let result = match callback {
            LocalCallback::Executable(path) => {
                if confirm && !self.options.force_destructive {
                    transcript.ensure_newline();
                    let question = format!(
                        "May I execute callback '{}' for function '{}'?",
                        path.display(),
                        signature
                    );
                    if !self.operator.confirm(&question).await {
                        transcript.skipped(&format!(
                            "Skipped execution of callback '{}' for function '{}'.",
                            path.display(),
                            signature
                        ));
                        history.append_user(decline_turn(signature));
                        return Ok(());
                    }
                }

                transcript.verbose(Verbosity::Medium, "executing callback...");
                run_executable(path, call.arguments()).await?
            }
            LocalCallback::Stdin => {
                transcript.ensure_newline();
                self.operator
                    .read_line(&format!("Type your answer for function '{}'", signature))
                    .await?
            }
            LocalCallback::Format(template) => render_format(template.as_deref(), call.arguments())?,
        };

        if !self.options.recurse {
            transcript.warn(&format!("Not recursing, ignoring the result of '{}'.", signature));
        }

        self.record_result(signature, result.trim_end(), history, transcript);
        Ok(())
    }

    async fn dispatch_remote(
        &self,
        call: &ToolCall,
        signature: &str,
        server_key: &str,
        destructive: bool,
        history: &mut History,
        transcript: &mut Transcript,
    ) -> Result<(), DispatchError> {
        if history.contains_text(signature) {
            return Err(DispatchError::LoopDetected(signature.to_string()));
        }

        let session = self
            .sessions
            .get(server_key)
            .ok_or_else(|| DispatchError::MissingSession(call.name().to_string()))?;

        if destructive && !self.options.force_destructive {
            transcript.ensure_newline();
            let question = format!(
                "May I call tool '{}' from '{}' for function '{}'?",
                call.name(),
                session.redacted_key(),
                signature
            );
            if !self.operator.confirm(&question).await {
                transcript.skipped(&format!(
                    "Skipped execution of MCP tool '{}' from '{}' for function '{}'.",
                    call.name(),
                    session.redacted_key(),
                    signature
                ));
                history.append_user(decline_turn(signature));
                return Ok(());
            }
        }

        transcript.verbose(Verbosity::Medium, "calling MCP tool...");
        let content = session.call_tool(call.name(), call.arguments().clone()).await?;

        self.record_result(signature, &remote_result_text(&content), history, transcript);
        Ok(())
    }

    fn record_result(&self, signature: &str, text: &str, history: &mut History, transcript: &mut Transcript) {
        if self.options.show_results || transcript.verbosity() >= Verbosity::Minimum {
            transcript.ensure_newline();
            transcript.result(text);
        }
        history.append_user(result_turn(signature, text));
    }
}
