//! # LLM provider seam
//!
//! [`LlmProvider`] is the consumed chat-completion interface. The turn queue
//! never talks to a provider directly: [`ProviderTurnHandler`] adapts one into
//! a [`TurnHandler`], consulting an optional circuit breaker and normalizing
//! tool-call arguments before the response reaches the submitter.
//!
//! [`MockProvider`] replays scripted replies with configurable latency and
//! records call timing and concurrency for tests and the CLI.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use encore_core::{ApiKey, ClassifiedError};
use encore_resilience::{ConsecutiveFailureBreaker, with_circuit_breaker};
use futures::Stream;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::turn_queue::{TurnContext, TurnHandler};

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

/// Message author.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End user.
    User,
    /// Model output.
    Assistant,
    /// Tool result.
    Tool,
}

/// One chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author.
    pub role: Role,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// Tool invocations requested by the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// A tool invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned id.
    pub id: String,
    /// Function name and arguments.
    pub function: FunctionCall,
}

/// Function part of a [`ToolCall`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Tool name.
    pub name: String,
    /// Arguments as a JSON string or object; a string after normalization.
    #[serde(default)]
    pub arguments: Value,
}

/// One completion choice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Generated message.
    pub message: ChatMessage,
    /// Why generation stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Token usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub prompt_tokens: u32,
    /// Completion tokens.
    pub completion_tokens: u32,
    /// Sum of both.
    pub total_tokens: u32,
}

/// Chat completion result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Completion choices; the first is used.
    pub choices: Vec<Choice>,
    /// Token usage, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Single-choice assistant response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ChatMessage::assistant(content),
                finish_reason: Some("stop".into()),
            }],
            usage: None,
        }
    }

    /// Content of the first choice.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// A tool the model may call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// Request parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Model id.
    pub model: String,
    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "mock".into(),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Incremental output of [`LlmProvider::call_stream`].
#[derive(Clone, Debug, PartialEq)]
pub enum StreamDelta {
    /// A content fragment.
    Content(String),
    /// A complete tool call.
    ToolCall(ToolCall),
    /// End of stream with the completion summary.
    Done {
        /// Why generation stopped.
        finish_reason: Option<String>,
        /// Token usage.
        usage: Option<Usage>,
    },
}

/// Boxed stream returned by [`LlmProvider::call_stream`].
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, ClassifiedError>> + Send>>;

// ─────────────────────────────────────────────────────────────────────────────
// Provider trait
// ─────────────────────────────────────────────────────────────────────────────

/// Chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One completion.
    async fn call(
        &self,
        api_key: &ApiKey,
        config: &ProviderConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChatResponse, ClassifiedError>;

    /// Streaming completion. The default replays [`call`](Self::call) as
    /// deltas.
    async fn call_stream(
        &self,
        api_key: &ApiKey,
        config: &ProviderConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<DeltaStream, ClassifiedError> {
        let response = self.call(api_key, config, messages, tools).await?;
        Ok(Box::pin(async_stream::stream! {
            let usage = response.usage;
            let mut finish_reason = None;
            if let Some(choice) = response.choices.into_iter().next() {
                finish_reason = choice.finish_reason;
                if !choice.message.content.is_empty() {
                    yield Ok(StreamDelta::Content(choice.message.content));
                }
                for call in choice.message.tool_calls {
                    yield Ok(StreamDelta::ToolCall(call));
                }
            }
            yield Ok(StreamDelta::Done { finish_reason, usage });
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool argument normalization
// ─────────────────────────────────────────────────────────────────────────────

/// Converts tool-call arguments into a canonical JSON string.
pub trait ToolArgumentNormalizer: Send + Sync {
    /// Normalize one argument value.
    fn normalize(&self, tool_name: &str, arguments: &Value) -> String;
}

impl<F> ToolArgumentNormalizer for F
where
    F: Fn(&str, &Value) -> String + Send + Sync,
{
    fn normalize(&self, tool_name: &str, arguments: &Value) -> String {
        self(tool_name, arguments)
    }
}

/// Default normalizer backed by [`normalize_tool_arguments`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CanonicalArguments;

impl ToolArgumentNormalizer for CanonicalArguments {
    fn normalize(&self, tool_name: &str, arguments: &Value) -> String {
        let normalized = normalize_tool_arguments(arguments);
        if normalized == "{}" && !is_empty_arguments(arguments) {
            debug!(tool_name, "tool arguments normalized to empty object");
        }
        normalized
    }
}

fn is_empty_arguments(arguments: &Value) -> bool {
    match arguments {
        Value::Null => true,
        Value::String(s) => matches!(s.trim(), "" | "{}"),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Compact JSON object text for tool arguments given as a string or object.
///
/// Fails open: empty, malformed, or non-object arguments become `{}` so the
/// tool can still be attempted. Object keys come out sorted.
pub fn normalize_tool_arguments(arguments: &Value) -> String {
    let parsed = match arguments {
        Value::Object(_) => arguments.clone(),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return "{}".into();
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        error = %e,
                        args_preview = %trimmed.chars().take(100).collect::<String>(),
                        "failed to parse tool call arguments, using empty object"
                    );
                    return "{}".into();
                }
            }
        }
        _ => return "{}".into(),
    };
    match parsed {
        Value::Object(_) => serde_json::to_string(&parsed).unwrap_or_else(|_| "{}".into()),
        other => {
            warn!(parsed_type = %json_type(&other), "tool call arguments are not an object, using empty object");
            "{}".into()
        }
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProviderTurnHandler
// ─────────────────────────────────────────────────────────────────────────────

/// Adapts an [`LlmProvider`] into a [`TurnHandler`].
pub struct ProviderTurnHandler {
    provider: Arc<dyn LlmProvider>,
    api_key: ApiKey,
    config: ProviderConfig,
    system_prompt: Option<String>,
    tools: Vec<ToolDefinition>,
    normalizer: Arc<dyn ToolArgumentNormalizer>,
    breaker: Option<Arc<ConsecutiveFailureBreaker>>,
}

impl ProviderTurnHandler {
    /// Handler with the default normalizer and no breaker.
    pub fn new(provider: Arc<dyn LlmProvider>, api_key: ApiKey, config: ProviderConfig) -> Self {
        Self {
            provider,
            api_key,
            config,
            system_prompt: None,
            tools: Vec::new(),
            normalizer: Arc::new(CanonicalArguments),
            breaker: None,
        }
    }

    /// Prepend a system message to every turn.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Offer tools to the model.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Replace the tool argument normalizer.
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Arc<dyn ToolArgumentNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Consult and feed a circuit breaker around every call.
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<ConsecutiveFailureBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    fn messages(&self, turn: &TurnContext) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.push(ChatMessage::user(turn.message.clone()));
        messages
    }

    fn normalize(&self, mut response: ChatResponse) -> ChatResponse {
        for choice in &mut response.choices {
            for call in &mut choice.message.tool_calls {
                let canonical = self
                    .normalizer
                    .normalize(&call.function.name, &call.function.arguments);
                call.function.arguments = Value::String(canonical);
            }
        }
        response
    }
}

#[async_trait]
impl TurnHandler for ProviderTurnHandler {
    async fn handle(&self, turn: &TurnContext, attempt: u32) -> Result<ChatResponse, ClassifiedError> {
        let messages = self.messages(turn);
        let tools = (!self.tools.is_empty()).then_some(self.tools.as_slice());
        debug!(turn_id = %turn.id, attempt, model = %self.config.model, "calling provider");

        let call = || self.provider.call(&self.api_key, &self.config, &messages, tools);
        let result = match &self.breaker {
            Some(breaker) => {
                let result = with_circuit_breaker(breaker.as_ref(), call).await;
                breaker.record(&result);
                result
            }
            None => call().await,
        };
        result.map(|response| self.normalize(response))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MockProvider
// ─────────────────────────────────────────────────────────────────────────────

/// One scripted reply.
#[derive(Clone, Debug)]
pub struct MockReply {
    /// Latency before the reply.
    pub delay: Duration,
    /// What the call returns.
    pub result: Result<ChatResponse, ClassifiedError>,
}

/// Scripted provider. Once the script runs out it echoes the last user
/// message after a latency drawn from the configured range.
#[derive(Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<MockReply>>,
    latency_ms: (u64, u64),
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
}

impl MockProvider {
    /// Echoing provider with no latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Random latency in `[min_ms, max_ms]` for unscripted calls.
    #[must_use]
    pub fn with_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.latency_ms = (min_ms, max_ms.max(min_ms));
        self
    }

    /// Queue a reply.
    pub fn push_reply(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    /// Queue an immediate error.
    pub fn push_error(&self, error: ClassifiedError) {
        self.push_reply(MockReply {
            delay: Duration::ZERO,
            result: Err(error),
        });
    }

    /// Queue an immediate success.
    pub fn push_response(&self, response: ChatResponse) {
        self.push_reply(MockReply {
            delay: Duration::ZERO,
            result: Ok(response),
        });
    }

    /// Calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Start instant of every call.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().clone()
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> MockReply {
        if let Some(reply) = self.script.lock().pop_front() {
            return reply;
        }
        let (min, max) = self.latency_ms;
        let delay = if max == 0 {
            0
        } else {
            rand::rng().random_range(min..=max)
        };
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str());
        MockReply {
            delay: Duration::from_millis(delay),
            result: Ok(ChatResponse::text(format!("echo: {last_user}"))),
        }
    }
}

/// Decrements the in-flight counter when a call ends or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn call(
        &self,
        _api_key: &ApiKey,
        _config: &ProviderConfig,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> Result<ChatResponse, ClassifiedError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        let _ = self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let reply = self.next_reply(messages);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.result
    }
}
