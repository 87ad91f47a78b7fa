mod common;

use actix_web::http::StatusCode;
use actix_web::test::{call_service, init_service, read_body_json, TestRequest};
use common::{create_test_state, test_config};
use llm_relay::broker::Broker;
use llm_relay::server::build_app;
use llm_relay::tasks::{QueueName, TaskId, TaskStatus};
use serde_json::{json, Value};

#[actix_web::test]
async fn test_health_reports_backend() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let resp = call_service(&app, TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = read_body_json(resp).await;
    assert_eq!(body, json!({"status": "ok", "backend": "memory"}));
}

#[actix_web::test]
async fn test_full_health_degraded_without_workers() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let resp = call_service(&app, TestRequest::get().uri("/health/full").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = read_body_json(resp).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["broker"], "connected");
    assert_eq!(body["workers"], "no_workers");
    assert_eq!(body["openai"], "missing");
}

#[actix_web::test]
async fn test_async_chat_queues_task() {
    let config = test_config(None);
    let (state, broker) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let req = TestRequest::post()
        .uri("/chat/async")
        .set_json(json!({"message": "Hello", "session_id": "s-42", "priority": 8}))
        .to_request();
    let resp = call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("x-session-id").unwrap(), "s-42");
    assert!(resp.headers().contains_key("x-request-id"));

    let body: Value = read_body_json(resp).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["session_id"], "s-42");
    assert_eq!(body["stream_url"], "/stream/s-42");

    // Priority 8 lands on the high queue with a PENDING record
    assert_eq!(broker.queue_len(QueueName::High).await.unwrap(), 1);
    let task_id = TaskId::from(body["task_id"].as_str().unwrap());
    let record = broker.load_task(&task_id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
}

#[actix_web::test]
async fn test_async_chat_generates_session_id() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let req = TestRequest::post()
        .uri("/chat/async")
        .set_json(json!({"message": "Hello"}))
        .to_request();
    let body: Value = read_body_json(call_service(&app, req).await).await;
    let session_id = body["session_id"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(session_id).is_ok());
}

#[actix_web::test]
async fn test_chat_rejects_out_of_range_priority() {
    let config = test_config(None);
    let (state, broker) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    for priority in [11, -11] {
        let req = TestRequest::post()
            .uri("/chat/async")
            .set_json(json!({"message": "Hello", "priority": priority}))
            .to_request();
        let resp = call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    let req = TestRequest::post()
        .uri("/chat")
        .set_json(json!({"message": "Hello", "priority": 99}))
        .to_request();
    assert_eq!(
        call_service(&app, req).await.status(),
        StatusCode::UNPROCESSABLE_ENTITY
    );

    for queue in QueueName::all() {
        assert_eq!(broker.queue_len(queue).await.unwrap(), 0);
    }
}

#[actix_web::test]
async fn test_chat_rejects_missing_message() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let req = TestRequest::post()
        .uri("/chat/async")
        .set_json(json!({"session_id": "s"}))
        .to_request();
    let resp = call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body: Value = read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["code"], "422");
}

#[actix_web::test]
async fn test_malformed_json_is_bad_request() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let req = TestRequest::post()
        .uri("/chat/async")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    assert_eq!(call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_oversized_payload_rejected() {
    let mut config = test_config(None);
    config.api.max_payload_size = 64;
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let req = TestRequest::post()
        .uri("/chat/async")
        .set_json(json!({"message": "x".repeat(256)}))
        .to_request();
    assert_eq!(
        call_service(&app, req).await.status(),
        StatusCode::PAYLOAD_TOO_LARGE
    );
}

#[actix_web::test]
async fn test_unknown_task_reads_as_pending() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let resp = call_service(&app, TestRequest::get().uri("/chat/nope").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = read_body_json(resp).await;
    assert_eq!(body["task_id"], "nope");
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["ready"], false);
    assert!(body.get("result").is_none());
}

#[actix_web::test]
async fn test_stream_timeout_above_max_rejected() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let uri = format!(
        "/stream/s1?timeout={}",
        config.api.stream_max_timeout_secs + 1
    );
    let resp = call_service(&app, TestRequest::get().uri(&uri).to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[actix_web::test]
async fn test_stream_malformed_timeout_is_validation_error() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    for uri in ["/stream/s1?timeout=abc", "/stream/s1?timeout=-1"] {
        let resp = call_service(&app, TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Invalid query parameters"));
    }
}

#[actix_web::test]
async fn test_embeddings_limit() {
    let config = test_config(None);
    let (state, broker) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let texts: Vec<String> = (0..101).map(|i| format!("text {}", i)).collect();
    let req = TestRequest::post()
        .uri("/embeddings")
        .set_json(json!({ "texts": texts }))
        .to_request();
    assert_eq!(call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    let req = TestRequest::post()
        .uri("/embeddings")
        .set_json(json!({ "texts": ["a", "b"] }))
        .to_request();
    let body: Value = read_body_json(call_service(&app, req).await).await;
    assert_eq!(body["status"], "queued");
    let task_id = body["task_id"].as_str().unwrap();
    assert_eq!(body["status_url"], format!("/embeddings/{}", task_id));
    assert_eq!(broker.queue_len(QueueName::Default).await.unwrap(), 1);

    let uri = format!("/embeddings/{}", task_id);
    let body: Value =
        read_body_json(call_service(&app, TestRequest::get().uri(&uri).to_request()).await).await;
    assert_eq!(body, json!({"status": "PENDING", "ready": false}));
}

#[actix_web::test]
async fn test_stats_counts_queued_tasks() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    for priority in [10, 0, 0, -10] {
        let req = TestRequest::post()
            .uri("/chat/async")
            .set_json(json!({"message": "Hello", "priority": priority}))
            .to_request();
        assert_eq!(call_service(&app, req).await.status(), StatusCode::OK);
    }

    let body: Value =
        read_body_json(call_service(&app, TestRequest::get().uri("/stats").to_request()).await)
            .await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queues"], json!({"high": 1, "default": 2, "low": 1}));
    assert_eq!(body["pending_tasks"], 4);
    assert_eq!(body["workers"], 0);
    assert_eq!(body["active_tasks"], 0);
}

#[actix_web::test]
async fn test_openai_completions_requires_messages() {
    let config = test_config(None);
    let (state, broker) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let req = TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(json!({"model": "gpt-4o-mini"}))
        .to_request();
    let resp = call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: Value = read_body_json(resp).await;
    assert_eq!(body["error"]["message"], "messages field is required");
    assert_eq!(broker.queue_len(QueueName::Default).await.unwrap(), 0);
}

#[actix_web::test]
async fn test_cors_preflight_allows_any_origin_by_default() {
    let config = test_config(None);
    let (state, _) = create_test_state(config.clone());
    let app = init_service(build_app(state, &config.api)).await;

    let req = TestRequest::default()
        .method(actix_web::http::Method::OPTIONS)
        .uri("/chat/async")
        .insert_header(("origin", "http://example.com"))
        .insert_header(("access-control-request-method", "POST"))
        .to_request();
    let resp = call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}
