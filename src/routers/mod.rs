//! HTTP handlers
//!
//! - [`chat`]: native chat, task status, session streams and embeddings
//! - [`openai`]: OpenAI-compatible `/v1` surface
//! - [`system`]: health and queue statistics
//! - [`relay`]: SSE bodies fed by session subscriptions

pub mod chat;
pub mod openai;
pub mod relay;
pub mod system;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(system::health)
        .service(system::health_full)
        .service(system::stats)
        .service(chat::chat)
        .service(chat::chat_async)
        .service(chat::task_status)
        .service(chat::stream_session)
        .service(chat::create_embeddings)
        .service(chat::embeddings_result)
        .service(openai::chat_completions)
        .service(openai::list_models)
        .service(openai::retrieve_model);
}
