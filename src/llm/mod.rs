//! LLM integration for puzzle-forge.
//!
//! Two remote-call boundaries are exposed:
//!
//! - [`LlmProvider`]: one synchronous request per work item
//! - [`BatchProvider`]: grouped submission with asynchronous polling
//!
//! [`AnthropicClient`] implements both against the Anthropic API.
//!
//! ```ignore
//! use puzzle_forge::llm::{AnthropicClient, GenerationRequest, LlmProvider, Message};
//!
//! let client = AnthropicClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("Hello!")]);
//! let response = client.generate(request).await?;
//! println!("{}", response.text());
//! ```

pub mod anthropic;
pub mod batch;
pub mod types;

pub use anthropic::{AnthropicClient, ANTHROPIC_BASE_URL, DEFAULT_MODEL};
pub use batch::{BatchEntry, BatchEntryOutcome, BatchProvider, BatchRequest, BatchStatus};
pub use types::{
    ContentBlock, GenerationRequest, GenerationResponse, ImageSource, LlmProvider, Message, Usage,
    DEFAULT_MAX_TOKENS,
};
