use serde_json::{json, Value};

use super::context::TaskContext;
use super::error::{TaskError, TaskResult};

/// Embed `texts` in one upstream call
pub async fn run(ctx: &TaskContext, texts: &[String], model: &str) -> TaskResult<Value> {
    let wait = ctx.rate_limit_timeout * 2;
    if !ctx.limiter.acquire(1.0, wait).await {
        return Err(TaskError::RateLimitTimeout(wait));
    }

    let response = ctx.openai.embeddings(model, texts).await?;
    let embeddings: Vec<Value> = response["data"]
        .as_array()
        .map(|items| items.iter().map(|item| item["embedding"].clone()).collect())
        .unwrap_or_default();

    let dimensions = embeddings
        .first()
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    Ok(json!({
        "count": embeddings.len(),
        "dimensions": dimensions,
        "embeddings": embeddings,
        "model": model,
    }))
}
