use std::time::Duration;

use actix_web::{get, post, web, HttpResponse};
use serde_json::json;
use tracing::info;

use super::relay;
use crate::error::{ApiError, ApiResult};
use crate::protocols::api::{
    ChatRequest, EmbeddingsRequest, StreamQuery, TaskResponse, TaskStatusResponse,
    MAX_EMBEDDING_TEXTS,
};
use crate::server::AppState;
use crate::tasks::{stream_channel, TaskEnvelope, TaskId, TaskKind, TaskRecord, TaskStatus};

fn event_stream_response() -> actix_web::HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("Connection", "keep-alive"));
    builder
}

async fn submit_chat(
    data: &AppState,
    req: &ChatRequest,
    session_id: &str,
) -> ApiResult<TaskEnvelope> {
    let completion_params = req.completion_params(
        data.openai.default_model(),
        &data.config.api.default_system_prompt,
    );
    let kind = TaskKind::ChatCompletion {
        session_id: session_id.to_string(),
        completion_params,
    };
    Ok(data.dispatcher.submit(kind, req.priority).await?)
}

fn session_id_for(req: &ChatRequest) -> String {
    req.session_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

async fn load_record(data: &AppState, task_id: String) -> ApiResult<TaskRecord> {
    let task_id = TaskId(task_id);
    Ok(data
        .broker
        .load_task(&task_id)
        .await?
        .unwrap_or_else(|| TaskRecord::unknown(task_id)))
}

/// Queue a chat task and stream its session events in the same response
#[post("/chat")]
pub async fn chat(
    body: web::Json<ChatRequest>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let req = body.into_inner();
    req.validate().map_err(ApiError::Validation)?;

    let session_id = session_id_for(&req);
    // Subscribe first so no event published by a fast worker is missed
    let subscription = data.broker.subscribe(&stream_channel(&session_id)).await?;
    let envelope = submit_chat(&data, &req, &session_id).await?;

    let timeout = Duration::from_secs(data.config.api.api_timeout_secs);
    Ok(event_stream_response()
        .insert_header(("X-Session-ID", session_id))
        .insert_header(("X-Task-ID", envelope.id.to_string()))
        .streaming(relay::native_events(subscription, timeout)))
}

/// Queue a chat task; the caller follows `stream_url` or polls `/chat/{task_id}`
#[post("/chat/async")]
pub async fn chat_async(
    body: web::Json<ChatRequest>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let req = body.into_inner();
    req.validate().map_err(ApiError::Validation)?;

    let session_id = session_id_for(&req);
    let envelope = submit_chat(&data, &req, &session_id).await?;

    Ok(HttpResponse::Ok()
        .insert_header(("X-Session-ID", session_id.clone()))
        .insert_header(("X-Task-ID", envelope.id.to_string()))
        .json(TaskResponse::queued(envelope.id, session_id)))
}

#[get("/chat/{task_id}")]
pub async fn task_status(
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let record = load_record(&data, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(TaskStatusResponse::from(record)))
}

#[get("/stream/{session_id}")]
pub async fn stream_session(
    path: web::Path<String>,
    query: web::Query<StreamQuery>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let api = &data.config.api;
    let timeout = query.timeout.unwrap_or(api.stream_default_timeout_secs);
    if timeout > api.stream_max_timeout_secs {
        return Err(ApiError::Validation(format!(
            "timeout must be less than or equal to {}",
            api.stream_max_timeout_secs
        )));
    }

    let session_id = path.into_inner();
    let subscription = data.broker.subscribe(&stream_channel(&session_id)).await?;
    info!("Relaying session {} (timeout {}s)", session_id, timeout);

    Ok(event_stream_response().streaming(relay::native_events(
        subscription,
        Duration::from_secs(timeout),
    )))
}

#[post("/embeddings")]
pub async fn create_embeddings(
    body: web::Json<EmbeddingsRequest>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let req = body.into_inner();
    if req.texts.len() > MAX_EMBEDDING_TEXTS {
        return Err(ApiError::BadRequest(format!(
            "Maximum {} texts per request",
            MAX_EMBEDDING_TEXTS
        )));
    }

    let envelope = data
        .dispatcher
        .submit(
            TaskKind::BatchEmbeddings {
                texts: req.texts,
                model: req.model,
            },
            0,
        )
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "queued",
        "status_url": format!("/embeddings/{}", envelope.id),
        "task_id": envelope.id,
    })))
}

#[get("/embeddings/{task_id}")]
pub async fn embeddings_result(
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let record = load_record(&data, path.into_inner()).await?;

    match record.status {
        TaskStatus::Success => Ok(HttpResponse::Ok().json(json!({
            "status": "SUCCESS",
            "ready": true,
            "result": record.result,
        }))),
        TaskStatus::Failure => Err(ApiError::Internal(format!(
            "Task failed: {}",
            record.error.unwrap_or_default()
        ))),
        status => Ok(HttpResponse::Ok().json(json!({
            "status": status,
            "ready": false,
        }))),
    }
}
