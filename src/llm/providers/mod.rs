//! LLM Providers Module
//!
//! - `openai`: streaming client for any OpenAI-compatible `/chat/completions` endpoint
//! - `scripted`: in-process provider replaying fixed chunks, for local runs and tests

pub mod openai;
pub mod scripted;

pub use openai::OpenAIClient;
pub use scripted::ScriptedClient;
