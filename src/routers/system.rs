use actix_web::{get, web, HttpResponse};
use serde_json::json;

use crate::broker::BrokerResult;
use crate::server::AppState;
use crate::tasks::QueueName;

#[get("/health")]
pub async fn health(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "backend": data.broker.kind(),
    }))
}

#[get("/health/full")]
pub async fn health_full(data: web::Data<AppState>) -> HttpResponse {
    let broker_ok = data.broker.ping().await.is_ok();
    let workers = if broker_ok {
        data.broker.list_workers().await.map(|w| w.len()).unwrap_or(0)
    } else {
        0
    };
    let openai_ok = data.openai.is_configured();

    HttpResponse::Ok().json(json!({
        "status": if broker_ok && workers > 0 { "ok" } else { "degraded" },
        "backend": data.broker.kind(),
        "broker": if broker_ok { "connected" } else { "disconnected" },
        "workers": if workers > 0 { "active" } else { "no_workers" },
        "worker_count": workers,
        "openai": if openai_ok { "configured" } else { "missing" },
    }))
}

async fn collect_stats(data: &AppState) -> BrokerResult<serde_json::Value> {
    let mut queues = serde_json::Map::new();
    let mut pending = 0;
    for queue in QueueName::all() {
        let len = data.broker.queue_len(queue).await?;
        pending += len;
        queues.insert(queue.as_str().to_string(), json!(len));
    }

    let workers = data.broker.list_workers().await?;
    let active: usize = workers.iter().map(|w| w.active_tasks).sum();

    Ok(json!({
        "status": "ok",
        "queues": queues,
        "pending_tasks": pending,
        "workers": workers.len(),
        "active_tasks": active,
    }))
}

/// Queue depths and worker activity. Broker failures are reported in the body.
#[get("/stats")]
pub async fn stats(data: web::Data<AppState>) -> HttpResponse {
    match collect_stats(&data).await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => HttpResponse::Ok().json(json!({
            "status": "error",
            "error": e.to_string(),
            "queues": {},
            "workers": 0,
        })),
    }
}
