pub mod azure;
pub mod provider;
pub mod types;

pub use azure::AzureOpenAiClient;
pub use provider::{ChatModel, Embedder, LlmError};
pub use types::{ChatMessage, ChatReply, ChatRequest, ToolCall, ToolChoice, ToolSpec};
