use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::clients::{ChatOptions, ChatRequest, LLMClient, LLMError, Message};
use crate::dispatch::{DispatchError, ToolDispatcher};
use crate::history::{History, Turn};
use crate::mcp::MCPError;
use crate::output::{Transcript, Verbosity};
use crate::stream::{REASONING_BEGIN, REASONING_END, StreamDecoder, StreamEvent};
use crate::tools::ToolError;

pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_TOP_P: f32 = 0.95;
pub const DEFAULT_TOP_K: i32 = 20;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Dispatch error: {0}")]
    Dispatch(String),
    #[error("possible infinite loop detected: '{0}'")]
    LoopDetected(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation worker failed: {0}")]
    Worker(String),
}

impl From<LLMError> for AgentError {
    fn from(error: LLMError) -> Self {
        AgentError::Transport(format!("generation failed: {}", error))
    }
}

impl From<ToolError> for AgentError {
    fn from(error: ToolError) -> Self {
        AgentError::Configuration(error.to_string())
    }
}

impl From<MCPError> for AgentError {
    fn from(error: MCPError) -> Self {
        match error {
            MCPError::InvalidSchema { .. } | MCPError::InvalidCommandLine(_) => {
                AgentError::Configuration(error.to_string())
            }
            _ => AgentError::Transport(error.to_string()),
        }
    }
}

impl From<DispatchError> for AgentError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::LoopDetected(signature) => AgentError::LoopDetected(signature),
            DispatchError::Remote(e) => AgentError::Transport(e.to_string()),
            other => AgentError::Dispatch(other.to_string()),
        }
    }
}

/// Everything that stays fixed across the attempts of one run.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub system_instruction: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub context_window: Option<u32>,
    pub stop: Vec<String>,
    pub output_schema: Option<Value>,
    pub with_thinking: bool,
    pub hide_reasoning: bool,
    pub recurse: bool,
    pub timeout: Duration,
}

impl GenerationOptions {
    pub fn new(model: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_instruction: system_instruction.into(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            context_window: None,
            stop: Vec::new(),
            output_schema: None,
            with_thinking: false,
            hide_reasoning: false,
            recurse: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_output_schema(mut self, schema: &str) -> Result<Self, AgentError> {
        let parsed = serde_json::from_str(schema)
            .map_err(|e| AgentError::Configuration(format!("invalid output JSON scheme: `{}`: {}", schema, e)))?;
        self.output_schema = Some(parsed);
        Ok(self)
    }

    fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            num_ctx: self.context_window,
            stop: (!self.stop.is_empty()).then(|| self.stop.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Requesting,
    Streaming,
    Dispatching,
    Deciding,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct Outcome {
    pub history: History,
    pub attempts: usize,
}

/// State owned by the worker of one attempt and handed back when it ends.
struct AttemptState {
    history: History,
    transcript: Transcript,
    phase: Phase,
    dispatched: usize,
}

impl AttemptState {
    fn enter(&mut self, phase: Phase) {
        tracing::trace!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }
}

pub struct Orchestrator {
    client: Arc<dyn LLMClient>,
    dispatcher: Arc<ToolDispatcher>,
    options: Arc<GenerationOptions>,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn LLMClient>, dispatcher: Arc<ToolDispatcher>, options: GenerationOptions) -> Self {
        Self {
            client,
            dispatcher,
            options: Arc::new(options),
        }
    }

    fn build_request(&self, prompt: &Turn, history: &History) -> ChatRequest {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::from(&Turn::system(&self.options.system_instruction)));
        messages.push(Message::from(prompt));
        messages.extend(history.to_messages());

        ChatRequest {
            model: self.options.model.clone(),
            messages,
            stream: true,
            tools: self.dispatcher.registry().declarations(),
            format: self.options.output_schema.clone(),
            options: self.options.chat_options(),
            think: Some(self.options.with_thinking),
        }
    }

    /// Generates until the model answers without tool calls (or recursion is
    /// off). A single deadline covers every attempt.
    pub async fn run(&self, prompt: Turn, transcript: Transcript) -> Result<Outcome, AgentError> {
        let deadline = Instant::now() + self.options.timeout;
        let mut state = AttemptState {
            history: History::new(),
            transcript,
            phase: Phase::Requesting,
            dispatched: 0,
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            state.dispatched = 0;
            state.enter(Phase::Requesting);

            let request = self.build_request(&prompt, &state.history);
            if state.transcript.verbosity() >= Verbosity::Maximum {
                let dumped = serde_json::to_string_pretty(&request).unwrap_or_default();
                state
                    .transcript
                    .verbose(Verbosity::Maximum, &format!("with generation request: {}", dumped));
            }
            tracing::debug!(attempt = attempts, messages = request.messages.len(), "requesting generation");

            let worker = tokio::spawn(run_attempt(
                Arc::clone(&self.client),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.options),
                request,
                state,
            ));

            let (returned, result) = match tokio::time::timeout_at(deadline, worker).await {
                Ok(Ok(finished)) => finished,
                Ok(Err(e)) => return Err(AgentError::Worker(e.to_string())),
                Err(_) => {
                    tracing::warn!(attempt = attempts, "deadline elapsed, abandoning generation worker");
                    return Err(AgentError::Timeout(self.options.timeout));
                }
            };
            state = returned;
            if let Err(e) = result {
                state.enter(Phase::Failed);
                state.transcript.ensure_newline();
                return Err(e);
            }

            state.enter(Phase::Deciding);
            if self.options.recurse && state.dispatched > 0 && state.history.ends_with_user() {
                if state.transcript.verbosity() >= Verbosity::Medium {
                    let dumped = serde_json::to_string_pretty(state.history.turns()).unwrap_or_default();
                    state
                        .transcript
                        .verbose(Verbosity::Medium, &format!("Generating recursively with history: {}", dumped));
                }
                continue;
            }

            state.enter(Phase::Done);
            break;
        }

        Ok(Outcome {
            history: state.history,
            attempts,
        })
    }
}

async fn run_attempt(
    client: Arc<dyn LLMClient>,
    dispatcher: Arc<ToolDispatcher>,
    options: Arc<GenerationOptions>,
    request: ChatRequest,
    mut state: AttemptState,
) -> (AttemptState, Result<(), AgentError>) {
    let result = stream_attempt(client.as_ref(), &dispatcher, &options, request, &mut state).await;
    (state, result)
}

async fn stream_attempt(
    client: &dyn LLMClient,
    dispatcher: &ToolDispatcher,
    options: &GenerationOptions,
    request: ChatRequest,
    state: &mut AttemptState,
) -> Result<(), AgentError> {
    let mut stream = client.stream_chat(request).await?;
    let mut decoder = StreamDecoder::new(options.hide_reasoning);
    state.enter(Phase::Streaming);

    while let Some(fragment) = stream.next().await {
        for event in decoder.decode(fragment?) {
            match event {
                StreamEvent::ReasoningBegin => {
                    state.transcript.reasoning_marker(REASONING_BEGIN);
                    state.history.append_assistant(REASONING_BEGIN);
                }
                StreamEvent::Reasoning(text) => {
                    state.transcript.reasoning(&text);
                    state.history.append_assistant(&text);
                }
                StreamEvent::ReasoningEnd => {
                    state.transcript.reasoning_marker(REASONING_END);
                    state.history.append_assistant(REASONING_END);
                }
                StreamEvent::Content(text) => {
                    state.transcript.content(&text);
                    state.history.append_assistant(&text);
                }
                StreamEvent::ToolCalls(calls) => {
                    state.enter(Phase::Dispatching);
                    if state.transcript.verbosity() >= Verbosity::Medium {
                        let dumped = serde_json::to_string_pretty(&calls).unwrap_or_default();
                        state
                            .transcript
                            .verbose(Verbosity::Medium, &format!("generated tool calls: {}", dumped));
                    }

                    for call in &calls {
                        dispatcher
                            .dispatch(call, &mut state.history, &mut state.transcript)
                            .await?;
                        state.dispatched += 1;
                    }
                    state.enter(Phase::Streaming);
                }
                StreamEvent::Images(images) => {
                    let handled = format!("Generated {} images.", images.len());
                    state.transcript.ensure_newline();
                    state.transcript.notice(&handled);
                    state.history.append_assistant(&handled);
                }
                StreamEvent::Done { reason, metrics } => {
                    state.transcript.ensure_newline();
                    state.transcript.verbose(
                        Verbosity::Minimum,
                        &format!(
                            "{} done[{}], load: {:?}, total: {:?}, prompt eval: {:.3}/s, eval: {:.3}/s",
                            options.model,
                            reason.unwrap_or_default(),
                            metrics.load(),
                            metrics.total(),
                            metrics.prompt_eval_rate(),
                            metrics.eval_rate(),
                        ),
                    );
                    return Ok(());
                }
            }
        }
    }

    Err(LLMError::Incomplete.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ChatFragment, FragmentStream, ModelInfo, ToolCall, ToolDefinition};
    use crate::dispatch::DispatchOptions;
    use crate::output::Operator;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use serde_json::{Map, json};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedModel {
        responses: Mutex<VecDeque<Vec<ChatFragment>>>,
        requests: Mutex<Vec<ChatRequest>>,
        stall: bool,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Vec<ChatFragment>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LLMClient for ScriptedModel {
        async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, LLMError> {
            self.requests.lock().unwrap().push(request);
            if self.stall {
                return Ok(Box::pin(futures::stream::pending::<Result<ChatFragment, LLMError>>()));
            }

            let fragments = self.responses.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(fragments.into_iter().map(Ok::<_, LLMError>))))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError> {
            Ok(Vec::new())
        }
    }

    struct Declining;

    #[async_trait]
    impl Operator for Declining {
        async fn confirm(&self, _prompt: &str) -> bool {
            false
        }

        async fn read_line(&self, _prompt: &str) -> std::io::Result<String> {
            Ok(String::new())
        }
    }

    fn format_dispatcher() -> Arc<ToolDispatcher> {
        let declarations = vec![ToolDefinition::function("categorize", "", json!({"type": "object"}))];
        let callbacks = HashMap::from([("categorize".to_string(), "@format=Category: {{.category}}".to_string())]);
        let registry = ToolRegistry::new(declarations, &callbacks, HashMap::new()).unwrap();

        Arc::new(ToolDispatcher::new(
            Arc::new(registry),
            &[],
            Arc::new(Declining),
            DispatchOptions {
                recurse: true,
                ..Default::default()
            },
        ))
    }

    fn categorize_call() -> ChatFragment {
        let mut arguments = Map::new();
        arguments.insert("category".to_string(), json!("animal"));
        ChatFragment::tool_calls(vec![ToolCall::new("categorize", arguments)])
    }

    fn quiet() -> Transcript {
        Transcript::new(Box::new(std::io::sink()), Verbosity::None, false)
    }

    #[tokio::test]
    async fn test_recursion_issues_one_more_request() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![categorize_call(), ChatFragment::done("stop")],
            vec![ChatFragment::content("It is an animal."), ChatFragment::done("stop")],
        ]));
        let mut options = GenerationOptions::new("test-model", "be brief");
        options.recurse = true;
        let orchestrator = Orchestrator::new(Arc::clone(&model) as Arc<dyn LLMClient>, format_dispatcher(), options);

        let outcome = orchestrator.run(Turn::user("what is a cat?"), quiet()).await.unwrap();

        assert_eq!(outcome.attempts, 2);
        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(
            requests[1].messages[2].content,
            r#"Result of function 'categorize({"category":"animal"})': Category: animal"#
        );
        assert_eq!(requests[1].tools.len(), 1);
        assert_eq!(
            outcome.history.last().map(|t| t.text.as_str()),
            Some("It is an animal.")
        );
    }

    #[tokio::test]
    async fn test_no_recursion_when_disabled() {
        let model = Arc::new(ScriptedModel::new(vec![vec![categorize_call(), ChatFragment::done("stop")]]));
        let orchestrator = Orchestrator::new(
            Arc::clone(&model) as Arc<dyn LLMClient>,
            format_dispatcher(),
            GenerationOptions::new("test-model", ""),
        );

        let outcome = orchestrator.run(Turn::user("what is a cat?"), quiet()).await.unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(model.requests().len(), 1);
        assert!(outcome.history.ends_with_user());
    }

    #[tokio::test]
    async fn test_plain_answer_ends_the_loop() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            ChatFragment::thinking("hmm"),
            ChatFragment::content("\nhello"),
            ChatFragment::done("stop"),
        ]]));
        let mut options = GenerationOptions::new("test-model", "");
        options.recurse = true;
        let orchestrator = Orchestrator::new(Arc::clone(&model) as Arc<dyn LLMClient>, format_dispatcher(), options);

        let outcome = orchestrator.run(Turn::user("hi"), quiet()).await.unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.history.len(), 1);
        assert_eq!(outcome.history.turns()[0].text, "<think>\nhmm</think>\n\nhello");
    }

    #[tokio::test]
    async fn test_stream_without_done_is_a_transport_error() {
        let model = Arc::new(ScriptedModel::new(vec![vec![ChatFragment::content("cut")]]));
        let orchestrator = Orchestrator::new(model, format_dispatcher(), GenerationOptions::new("m", ""));

        let err = orchestrator.run(Turn::user("hi"), quiet()).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }

    #[tokio::test]
    async fn test_deadline_abandons_the_worker() {
        let model = Arc::new(ScriptedModel {
            stall: true,
            ..Default::default()
        });
        let mut options = GenerationOptions::new("m", "");
        options.timeout = Duration::from_millis(50);
        let orchestrator = Orchestrator::new(model, format_dispatcher(), options);

        let err = orchestrator.run(Turn::user("hi"), quiet()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[test]
    fn test_request_shape() {
        let mut options = GenerationOptions::new("m", "system")
            .with_output_schema(r#"{"type": "object"}"#)
            .unwrap();
        options.stop = vec!["END".to_string()];
        let orchestrator = Orchestrator::new(Arc::new(ScriptedModel::default()), format_dispatcher(), options);

        let request = orchestrator.build_request(&Turn::user("hi").with_images(vec!["aW1n".to_string()]), &History::new());

        assert!(request.stream);
        assert_eq!(request.messages[0].content, "system");
        assert_eq!(request.messages[1].images, vec!["aW1n".to_string()]);
        assert_eq!(request.format, Some(json!({"type": "object"})));
        assert_eq!(request.options.stop, Some(vec!["END".to_string()]));
        assert_eq!(request.think, Some(false));
    }

    #[test]
    fn test_invalid_output_schema() {
        assert!(matches!(
            GenerationOptions::new("m", "").with_output_schema("{oops"),
            Err(AgentError::Configuration(_))
        ));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            AgentError::from(DispatchError::LoopDetected("f({})".to_string())),
            AgentError::LoopDetected(sig) if sig == "f({})"
        ));
        assert!(matches!(
            AgentError::from(MCPError::InvalidSchema {
                tool: "t".to_string(),
                reason: "array".to_string()
            }),
            AgentError::Configuration(_)
        ));
        assert!(matches!(
            AgentError::from(DispatchError::Remote(MCPError::SessionClosed("s".to_string()))),
            AgentError::Transport(_)
        ));
        assert!(matches!(
            AgentError::from(ToolError::DuplicateName("a".to_string())),
            AgentError::Configuration(_)
        ));
    }
}
