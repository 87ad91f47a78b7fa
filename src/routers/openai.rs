//! OpenAI-compatible surface
//!
//! Clients point an OpenAI SDK at `http://host:port/v1`. Requests are queued
//! like native chat tasks; every body field is forwarded upstream except the
//! `priority` extension, which picks the queue.

use std::time::Duration;

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::relay::{self, CompletionIdentity};
use crate::error::{ApiError, ApiResult};
use crate::middleware::get_request_id;
use crate::protocols::openai::{AssistantMessage, ChatChoice, ChatCompletionResponse, Usage};
use crate::server::AppState;
use crate::tasks::{
    stream_channel, TaskId, TaskKind, TaskRecord, TaskStatus, MAX_PRIORITY, MIN_PRIORITY,
};

/// Split the proxy's own fields off an incoming request body
fn prepare_params(body: Value, default_model: &str) -> ApiResult<(Value, i32)> {
    let Value::Object(mut params) = body else {
        return Err(ApiError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    };

    let priority = params
        .remove("priority")
        .and_then(|p| p.as_i64())
        .unwrap_or(0)
        .clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as i32;

    let has_messages = match params.get("messages") {
        Some(Value::Array(messages)) => !messages.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    };
    if !has_messages {
        return Err(ApiError::BadRequest(
            "messages field is required".to_string(),
        ));
    }

    params
        .entry("model")
        .or_insert_with(|| json!(default_model));

    Ok((Value::Object(params), priority))
}

#[post("/v1/chat/completions")]
pub async fn chat_completions(
    req: HttpRequest,
    body: web::Json<Value>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let (params, priority) = prepare_params(body.into_inner(), data.openai.default_model())?;
    let request_id = get_request_id(&req);
    let session_id = uuid::Uuid::new_v4().to_string();
    let model = params["model"].as_str().unwrap_or_default().to_string();
    let stream = params["stream"].as_bool().unwrap_or(false);
    let timeout = Duration::from_secs(data.config.api.api_timeout_secs);

    let kind = TaskKind::ChatCompletion {
        session_id: session_id.clone(),
        completion_params: params,
    };

    if stream {
        let subscription = data.broker.subscribe(&stream_channel(&session_id)).await?;
        data.dispatcher.submit(kind, priority).await?;

        let identity = CompletionIdentity {
            id: request_id,
            created: chrono::Utc::now().timestamp() as u64,
            model,
        };
        return Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header(("Cache-Control", "no-cache"))
            .streaming(relay::openai_events(subscription, identity, timeout)));
    }

    let envelope = data.dispatcher.submit(kind, priority).await?;
    let record = wait_for_result(&data, &envelope.id, timeout).await?;

    match record.status {
        TaskStatus::Success => Ok(HttpResponse::Ok().json(completion_body(
            record.result.unwrap_or(Value::Null),
            &request_id,
            &model,
        ))),
        _ => Err(ApiError::Internal(format!(
            "Task failed: {}",
            record.error.unwrap_or_default()
        ))),
    }
}

/// Poll the task record until it is ready or `timeout` passes
async fn wait_for_result(
    data: &AppState,
    task_id: &TaskId,
    timeout: Duration,
) -> ApiResult<TaskRecord> {
    let interval = Duration::from_millis(data.config.api.result_poll_interval_ms.max(10));
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(record) = data.broker.load_task(task_id).await? {
            if record.status.is_ready() {
                return Ok(record);
            }
        }
        if tokio::time::Instant::now() + interval > deadline {
            warn!("Task {} not ready within {:?}", task_id, timeout);
            return Err(ApiError::Timeout("Request timeout".to_string()));
        }
        tokio::time::sleep(interval).await;
    }
}

/// The upstream body with `id` replaced by the request id. Results without an
/// upstream body are wrapped in a minimal completion.
fn completion_body(result: Value, request_id: &str, model: &str) -> Value {
    if let Some(Value::Object(mut full)) = result.get("full_response").cloned() {
        full.insert("id".to_string(), json!(request_id));
        return Value::Object(full);
    }

    debug!("Task result has no upstream body, building completion");
    let content = result["response"].as_str().map(str::to_string);
    let usage = serde_json::from_value::<Usage>(result["usage"].clone()).unwrap_or_default();

    let response = ChatCompletionResponse {
        id: request_id.to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp() as u64,
        model: result["model"].as_str().unwrap_or(model).to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage,
    };
    serde_json::to_value(response).unwrap_or(Value::Null)
}

#[get("/v1/models")]
pub async fn list_models(data: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let models = data
        .openai
        .list_models()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to fetch models: {}", e)))?;
    Ok(HttpResponse::Ok().json(models))
}

#[get("/v1/models/{model_id}")]
pub async fn retrieve_model(
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let model = data
        .openai
        .retrieve_model(&path.into_inner())
        .await
        .map_err(|e| ApiError::NotFound(format!("Model not found: {}", e)))?;
    Ok(HttpResponse::Ok().json(model))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_params_pops_priority_and_defaults_model() {
        let (params, priority) = prepare_params(
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "priority": 8,
                "temperature": 0.2,
                "response_format": {"type": "json_object"}
            }),
            "gpt-4o-mini",
        )
        .unwrap();

        assert_eq!(priority, 8);
        assert!(params.get("priority").is_none());
        assert_eq!(params["model"], "gpt-4o-mini");
        assert_eq!(params["temperature"], 0.2);
        assert_eq!(params["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_prepare_params_requires_messages() {
        for body in [
            json!({"model": "gpt-4o"}),
            json!({"messages": []}),
            json!({"messages": null}),
            json!(["not", "an", "object"]),
        ] {
            assert!(prepare_params(body, "gpt-4o-mini").is_err());
        }
    }

    #[test]
    fn test_prepare_params_clamps_priority() {
        let (_, priority) = prepare_params(
            json!({"messages": [{"role": "user", "content": "x"}], "priority": 99}),
            "m",
        )
        .unwrap();
        assert_eq!(priority, MAX_PRIORITY);
    }

    #[test]
    fn test_completion_body_prefers_upstream_response() {
        let result = json!({
            "response": "Hello",
            "full_response": {"id": "upstream-id", "object": "chat.completion", "choices": []}
        });
        let body = completion_body(result, "chatcmpl-local", "gpt-4o-mini");
        assert_eq!(body["id"], "chatcmpl-local");
        assert_eq!(body["object"], "chat.completion");
    }

    #[test]
    fn test_completion_body_fallback() {
        let result = json!({
            "response": "Hello",
            "model": "gpt-4o",
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        });
        let body = completion_body(result, "chatcmpl-local", "gpt-4o-mini");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello");
        assert_eq!(body["usage"]["total_tokens"], 4);
    }
}
