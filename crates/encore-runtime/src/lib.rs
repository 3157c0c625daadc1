//! # encore-runtime
//!
//! Conversational turn processing.
//!
//! - [`TurnQueue`]: single-writer FIFO queue; at most one turn in flight
//! - [`LlmProvider`]: the chat-completion seam, with [`MockProvider`] for
//!   tests and the CLI
//! - [`ProviderTurnHandler`]: adapts a provider into a [`TurnHandler`] and
//!   canonicalizes tool-call arguments

#![deny(unsafe_code)]

pub mod provider;
pub mod turn_queue;

pub use provider::{
    CanonicalArguments, ChatMessage, ChatResponse, Choice, DeltaStream, FunctionCall, LlmProvider,
    MockProvider, MockReply, ProviderConfig, ProviderTurnHandler, Role, StreamDelta, ToolArgumentNormalizer,
    ToolCall, ToolDefinition, Usage, normalize_tool_arguments,
};
pub use turn_queue::{
    QueueMetrics, QueueStatus, Turn, TurnContext, TurnEvent, TurnHandle, TurnHandler, TurnOptions,
    TurnQueue, TurnQueueConfig, TurnQueueError, TurnState,
};
