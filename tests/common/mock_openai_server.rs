//! Mock upstream for testing

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use actix_web::{dev::ServerHandle, get, post, web, App, HttpResponse, HttpServer};
use bytes::Bytes;
use serde_json::{json, Value};

/// Requests naming this model are rejected with a 400
pub const REJECTED_MODEL: &str = "bad-model";

/// The first request naming this model gets a 503, later ones succeed
pub const FLAKY_MODEL: &str = "flaky-model";

/// Pieces the streaming endpoint sends, in order
pub const STREAM_PIECES: [&str; 2] = ["Hel", "lo"];

/// Mock OpenAI-compatible API server
pub struct MockOpenAIServer {
    addr: SocketAddr,
    handle: ServerHandle,
    flaky_calls: Arc<AtomicUsize>,
}

impl MockOpenAIServer {
    /// Start a server on an ephemeral port
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let calls = web::Data::from(flaky_calls.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(calls.clone())
                .service(chat_completions)
                .service(embeddings)
                .service(list_models)
                .service(retrieve_model)
        })
        .workers(1)
        .disable_signals()
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(server);

        // Give the server a moment to start
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        Self {
            addr,
            handle,
            flaky_calls,
        }
    }

    /// Chat requests seen for the flaky model so far
    pub fn flaky_calls(&self) -> usize {
        self.flaky_calls.load(Ordering::SeqCst)
    }

    /// Base URL including the `/v1` prefix
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub async fn stop(self) {
        self.handle.stop(false).await;
    }
}

fn rejected() -> HttpResponse {
    HttpResponse::BadRequest().json(json!({
        "error": {
            "message": format!("The model `{}` does not exist", REJECTED_MODEL),
            "type": "invalid_request_error",
        }
    }))
}

fn chunk(model: &str, content: Option<&str>, finish_reason: Option<&str>) -> Value {
    let delta = match content {
        Some(content) => json!({"content": content}),
        None => json!({}),
    };
    json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion.chunk",
        "created": 1677652288u64,
        "model": model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
    })
}

#[post("/v1/chat/completions")]
async fn chat_completions(
    body: web::Json<Value>,
    flaky_calls: web::Data<AtomicUsize>,
) -> HttpResponse {
    let model = body["model"].as_str().unwrap_or("gpt-4o-mini").to_string();
    if model == REJECTED_MODEL {
        return rejected();
    }
    if model == FLAKY_MODEL && flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return HttpResponse::ServiceUnavailable().json(json!({
            "error": {"message": "The server is overloaded", "type": "server_error"}
        }));
    }

    if body["stream"].as_bool().unwrap_or(false) {
        let mut frames: Vec<Value> = vec![json!({
            "id": "chatcmpl-upstream",
            "object": "chat.completion.chunk",
            "created": 1677652288u64,
            "model": model,
            "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}]
        })];
        frames.extend(STREAM_PIECES.iter().map(|p| chunk(&model, Some(p), None)));
        frames.push(chunk(&model, None, Some("stop")));

        let mut body: Vec<Result<Bytes, actix_web::Error>> = frames
            .iter()
            .map(|f| Ok(Bytes::from(format!("data: {}\n\n", f))))
            .collect();
        body.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));

        return HttpResponse::Ok()
            .content_type("text/event-stream")
            .streaming(futures::stream::iter(body));
    }

    HttpResponse::Ok().json(json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1677652288u64,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": STREAM_PIECES.concat()},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
    }))
}

#[post("/v1/embeddings")]
async fn embeddings(body: web::Json<Value>) -> HttpResponse {
    let model = body["model"].as_str().unwrap_or_default();
    if model == REJECTED_MODEL {
        return rejected();
    }
    let inputs = body["input"].as_array().cloned().unwrap_or_default();
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(i, _)| json!({"object": "embedding", "index": i, "embedding": [0.1, 0.2, 0.3]}))
        .collect();

    HttpResponse::Ok().json(json!({"object": "list", "data": data, "model": model}))
}

#[get("/v1/models")]
async fn list_models() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "object": "list",
        "data": [{"id": "gpt-4o-mini", "object": "model", "owned_by": "mock"}]
    }))
}

#[get("/v1/models/{model_id}")]
async fn retrieve_model(path: web::Path<String>) -> HttpResponse {
    let model_id = path.into_inner();
    if model_id != "gpt-4o-mini" {
        return HttpResponse::NotFound().json(json!({
            "error": {"message": format!("The model `{}` does not exist", model_id)}
        }));
    }
    HttpResponse::Ok().json(json!({"id": model_id, "object": "model", "owned_by": "mock"}))
}
