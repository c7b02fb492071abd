pub mod clients;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod history;
pub mod mcp;
pub mod output;
pub mod prompts;
pub mod stream;
pub mod tools;

pub use clients::{ChatFragment, ChatRequest, LLMClient, LLMError, OllamaClient, ToolCall, ToolDefinition};
pub use config::Config;
pub use core::{AgentError, GenerationOptions, Orchestrator, Outcome};
pub use dispatch::{DispatchError, DispatchOptions, ToolDispatcher};
pub use history::{History, Turn};
pub use mcp::{MCPError, McpSessionManager, ServerSpec, ToolSession};
pub use output::{ConsoleOperator, Operator, Transcript, Verbosity};
pub use stream::{StreamDecoder, StreamEvent};
pub use tools::{ToolError, ToolRegistry};
