use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_OLLAMA_HOST: &str = "http://127.0.0.1:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            function: ToolCallFunction {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.function.arguments
    }

    pub fn signature(&self) -> String {
        let args = serde_json::to_string(&self.function.arguments).unwrap_or_else(|_| "{}".to_string());
        format!("{}({})", self.function.name, args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn function_kind() -> String {
    "function".to_string()
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: function_kind(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub num_ctx: Option<u32>,
    pub stop: Option<Vec<String>>,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    pub format: Option<Value>,
    pub options: ChatOptions,
    pub think: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FragmentMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Aggregate counters reported on the terminal fragment. Durations are in nanoseconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationMetrics {
    #[serde(default)]
    pub load_duration: u64,
    #[serde(default)]
    pub total_duration: u64,
    #[serde(default)]
    pub prompt_eval_count: u64,
    #[serde(default)]
    pub prompt_eval_duration: u64,
    #[serde(default)]
    pub eval_count: u64,
    #[serde(default)]
    pub eval_duration: u64,
}

impl GenerationMetrics {
    pub fn load(&self) -> Duration {
        Duration::from_nanos(self.load_duration)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_duration)
    }

    pub fn prompt_eval_rate(&self) -> f64 {
        rate(self.prompt_eval_count, self.prompt_eval_duration)
    }

    pub fn eval_rate(&self) -> f64 {
        rate(self.eval_count, self.eval_duration)
    }
}

fn rate(count: u64, nanos: u64) -> f64 {
    if nanos == 0 {
        return 0.0;
    }
    count as f64 / Duration::from_nanos(nanos).as_secs_f64()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatFragment {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub message: FragmentMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(flatten)]
    pub metrics: GenerationMetrics,
}

impl ChatFragment {
    pub fn thinking(text: impl Into<String>) -> Self {
        let mut fragment = Self::assistant();
        fragment.message.thinking = text.into();
        fragment
    }

    pub fn content(text: impl Into<String>) -> Self {
        let mut fragment = Self::assistant();
        fragment.message.content = text.into();
        fragment
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        let mut fragment = Self::assistant();
        fragment.message.tool_calls = calls;
        fragment
    }

    pub fn images(images: Vec<String>) -> Self {
        let mut fragment = Self::assistant();
        fragment.message.images = images;
        fragment
    }

    pub fn done(reason: &str) -> Self {
        let mut fragment = Self::assistant();
        fragment.done = true;
        fragment.done_reason = Some(reason.to_string());
        fragment
    }

    fn assistant() -> Self {
        Self {
            message: FragmentMessage {
                role: "assistant".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Stream ended before completion")]
    Incomplete,
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<ChatFragment, LLMError>> + Send>>;

#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, LLMError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError>;
}

pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: normalize_host(host),
        }
    }

    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string());
        Self::new(&host)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

async fn api_error(response: reqwest::Response) -> LLMError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    LLMError::ApiError(format!("{}: {}", status, message))
}

fn parse_line(line: &[u8]) -> Option<Result<ChatFragment, LLMError>> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(e) => return Some(Err(LLMError::ParseError(e.to_string()))),
    };
    if line.is_empty() {
        return None;
    }

    let json: Value = match serde_json::from_str(line) {
        Ok(json) => json,
        Err(e) => return Some(Err(LLMError::ParseError(format!("{}: {}", e, line)))),
    };
    if let Some(error) = json.get("error").and_then(|e| e.as_str()) {
        return Some(Err(LLMError::ApiError(error.to_string())));
    }

    Some(serde_json::from_value(json).map_err(|e| LLMError::ParseError(e.to_string())))
}

fn parse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<ChatFragment, LLMError>> + Send {
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);

                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        if let Some(item) = parse_line(&line) {
                            let last = match &item {
                                Ok(fragment) => fragment.done,
                                Err(_) => true,
                            };
                            yield item;
                            if last {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(LLMError::RequestFailed(e.to_string()));
                    return;
                }
            }
        }

        // trailing line without a newline
        if let Some(item) = parse_line(&buffer) {
            yield item;
        }
    }
}

#[async_trait]
impl LLMClient for OllamaClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, LLMError> {
        let url = format!("{}/api/chat", self.base_url);
        tracing::debug!(%url, model = %request.model, messages = request.messages.len(), "sending chat request");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/x-ndjson")
            .json(&request)
            .send()
            .await
            .map_err(|e| LLMError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(Box::pin(parse_stream(response)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LLMError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| LLMError::ParseError(e.to_string()))?;
        Ok(list.models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("localhost:11434"), "http://localhost:11434");
        assert_eq!(normalize_host("https://ollama.example.com/"), "https://ollama.example.com");
    }

    #[test]
    fn test_signature_is_compact_json() {
        let mut args = Map::new();
        args.insert("num1".to_string(), serde_json::json!(42));
        args.insert("num2".to_string(), serde_json::json!(43));
        let call = ToolCall::new("add_numbers", args);

        assert_eq!(call.signature(), r#"add_numbers({"num1":42,"num2":43})"#);
    }

    #[test]
    fn test_request_omits_unset_options() {
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![],
            stream: true,
            tools: vec![],
            format: None,
            options: ChatOptions {
                temperature: 1.0,
                top_p: 0.95,
                top_k: 20,
                num_ctx: None,
                stop: None,
            },
            think: Some(false),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("format").is_none());
        assert!(json["options"].get("num_ctx").is_none());
        assert_eq!(json["think"], serde_json::json!(false));
    }

    #[test]
    fn test_parse_line_reports_api_error() {
        let item = parse_line(br#"{"error":"model not found"}"#).unwrap();
        assert!(matches!(item, Err(LLMError::ApiError(msg)) if msg == "model not found"));
        assert!(parse_line(b"   \n").is_none());
    }

    #[tokio::test]
    async fn test_stream_chat_decodes_ndjson() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"model":"m","message":{"role":"assistant","content":"","thinking":"hmm"},"done":false}"#,
            "\n",
            r#"{"model":"m","message":{"role":"assistant","content":"Hi"},"done":false}"#,
            "\n",
            r#"{"model":"m","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","eval_count":10,"eval_duration":1000000000}"#,
            "\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&server.uri());
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![Message {
                role: MessageRole::User,
                content: "hello".to_string(),
                images: vec![],
            }],
            stream: true,
            tools: vec![],
            format: None,
            options: ChatOptions {
                temperature: 1.0,
                top_p: 0.95,
                top_k: 20,
                num_ctx: None,
                stop: None,
            },
            think: None,
        };

        let fragments: Vec<_> = client.stream_chat(request).await.unwrap().collect().await;
        assert_eq!(fragments.len(), 3);

        let first = fragments[0].as_ref().unwrap();
        assert_eq!(first.message.thinking, "hmm");
        let last = fragments[2].as_ref().unwrap();
        assert!(last.done);
        assert_eq!(last.done_reason.as_deref(), Some("stop"));
        assert!((last.metrics.eval_rate() - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stream_chat_surfaces_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(404).set_body_string(r#"{"error":"model 'x' not found"}"#))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&server.uri());
        let request = ChatRequest {
            model: "x".to_string(),
            messages: vec![],
            stream: true,
            tools: vec![],
            format: None,
            options: ChatOptions {
                temperature: 1.0,
                top_p: 0.95,
                top_k: 20,
                num_ctx: None,
                stop: None,
            },
            think: None,
        };

        match client.stream_chat(request).await {
            Err(LLMError::ApiError(msg)) => assert!(msg.contains("model 'x' not found")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"models":[{"name":"llama3:8b","size":4661224676,"details":{"family":"llama"}}]}"#,
            ))
            .mount(&server)
            .await;

        let models = OllamaClient::new(&server.uri()).list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "llama3:8b");
        assert_eq!(models[0].size, 4661224676);
    }
}
