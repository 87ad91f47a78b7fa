//! Wire types of the HTTP API

pub mod api;
pub mod openai;
