//! LLM integration.
//!
//! An OpenAI-compatible chat client used as the transport for rubric
//! judges. The judge endpoint is configured through [`crate::config::JudgeSettings`],
//! which picks up `LITELLM_API_BASE` / `LITELLM_API_KEY` when loaded.
//!
//! ```ignore
//! use agent_evaluator::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_settings(&config.judge)?;
//! let request = GenerationRequest::new("", vec![Message::user("Score this.")])
//!     .with_json_response();
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message,
    ResponseFormat, Usage,
};
