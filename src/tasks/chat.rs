use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::context::TaskContext;
use super::error::{TaskError, TaskResult};
use super::{StreamEvent, TaskId};

/// Chat completion task
///
/// Publishes `status started`, waits for a rate limit token, then either
/// relays upstream deltas as `chunk` events or publishes the whole answer
/// as one `complete` event. `params` go to the upstream API untouched.
pub async fn run(
    ctx: &TaskContext,
    task_id: &TaskId,
    session_id: &str,
    params: &Value,
) -> TaskResult<Value> {
    ctx.publish(session_id, &StreamEvent::started(task_id))
        .await?;

    if !ctx.limiter.acquire(1.0, ctx.rate_limit_timeout).await {
        return Err(TaskError::RateLimitTimeout(ctx.rate_limit_timeout));
    }

    if !params.is_object() {
        return Err(TaskError::InvalidParams(
            "completion_params must be a JSON object".to_string(),
        ));
    }

    let model = params["model"]
        .as_str()
        .unwrap_or_else(|| ctx.openai.default_model())
        .to_string();

    if params["stream"].as_bool().unwrap_or(false) {
        stream_completion(ctx, session_id, params, model).await
    } else {
        sync_completion(ctx, session_id, params, model).await
    }
}

async fn stream_completion(
    ctx: &TaskContext,
    session_id: &str,
    params: &Value,
    model: String,
) -> TaskResult<Value> {
    let mut stream = ctx.openai.chat_completion_stream(params).await?;

    let mut full_response = String::new();
    let mut chunks = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() else {
            continue;
        };
        if content.is_empty() {
            continue;
        }

        full_response.push_str(content);
        chunks += 1;
        ctx.publish(
            session_id,
            &StreamEvent::Chunk {
                content: content.to_string(),
                index: chunks,
            },
        )
        .await?;
    }

    ctx.publish(
        session_id,
        &StreamEvent::Complete {
            total_chunks: Some(chunks),
            content: None,
        },
    )
    .await?;

    info!("Session {}: {} chars", session_id, full_response.chars().count());

    Ok(json!({
        "session_id": session_id,
        "response": full_response,
        "model": model,
        "chunks": chunks,
    }))
}

async fn sync_completion(
    ctx: &TaskContext,
    session_id: &str,
    params: &Value,
    model: String,
) -> TaskResult<Value> {
    let response = ctx.openai.chat_completion(params).await?;

    // Null for tool-call only answers
    let content = response["choices"][0]["message"]["content"].clone();

    ctx.publish(
        session_id,
        &StreamEvent::Complete {
            total_chunks: None,
            content: content.as_str().map(str::to_string),
        },
    )
    .await?;

    let usage = response.get("usage").cloned().unwrap_or(Value::Null);
    debug!("Session {}: usage {}", session_id, usage);

    Ok(json!({
        "session_id": session_id,
        "response": content,
        "model": model,
        "usage": usage,
        "full_response": response,
    }))
}
