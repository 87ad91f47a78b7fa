//! Client for the upstream OpenAI-compatible API

pub mod client;
pub mod sse;

pub use client::{OpenAIClient, OpenAIError, OpenAIResult};
pub use sse::{SseDecoder, SseFrame};
