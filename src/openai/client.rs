use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::sse::{SseDecoder, SseFrame};
use crate::config::OpenAIConfig;
use crate::core::is_retryable_status;

#[derive(Debug, thiserror::Error)]
pub enum OpenAIError {
    #[error("OpenAI API key is not configured")]
    NotConfigured,

    #[error("Request to OpenAI failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response; `message` is the upstream `error.message` when present
    #[error("Error code: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response from OpenAI: {0}")]
    Decode(String),
}

impl OpenAIError {
    pub fn status(&self) -> Option<u16> {
        match self {
            OpenAIError::Api { status, .. } => Some(*status),
            OpenAIError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            OpenAIError::NotConfigured | OpenAIError::Decode(_) => false,
            // Transport errors without a status are connection failures
            _ => self.status().map_or(true, is_retryable_status),
        }
    }
}

pub type OpenAIResult<T> = Result<T, OpenAIError>;

/// Streamed `chat.completion.chunk` objects
pub type ChunkStream = BoxStream<'static, OpenAIResult<Value>>;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    config: OpenAIConfig,
}

impl OpenAIClient {
    pub fn new(config: OpenAIConfig) -> OpenAIResult<Self> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(50)))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    fn request(&self, method: Method, path: &str) -> OpenAIResult<RequestBuilder> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(OpenAIError::NotConfigured)?;

        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut builder = self.http.request(method, url).bearer_auth(api_key);
        if let Some(org) = &self.config.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        Ok(builder)
    }

    /// Non-streaming chat completion. `params` is forwarded verbatim.
    pub async fn chat_completion(&self, params: &Value) -> OpenAIResult<Value> {
        let res = self
            .request(Method::POST, "/chat/completions")?
            .json(params)
            .send()
            .await?;
        json_body(res).await
    }

    /// Streaming chat completion, yielding each decoded chunk object.
    /// The stream ends at the upstream `[DONE]` sentinel.
    pub async fn chat_completion_stream(&self, params: &Value) -> OpenAIResult<ChunkStream> {
        let res = self
            .request(Method::POST, "/chat/completions")?
            .json(params)
            .send()
            .await?;
        let res = check_status(res).await?;
        Ok(decode_chunks(res.bytes_stream()).boxed())
    }

    pub async fn embeddings(&self, model: &str, texts: &[String]) -> OpenAIResult<Value> {
        let res = self
            .request(Method::POST, "/embeddings")?
            .json(&json!({ "model": model, "input": texts }))
            .send()
            .await?;
        json_body(res).await
    }

    pub async fn list_models(&self) -> OpenAIResult<Value> {
        let res = self.request(Method::GET, "/models")?.send().await?;
        json_body(res).await
    }

    pub async fn retrieve_model(&self, model_id: &str) -> OpenAIResult<Value> {
        let res = self
            .request(Method::GET, &format!("/models/{}", model_id))?
            .send()
            .await?;
        json_body(res).await
    }
}

async fn check_status(res: Response) -> OpenAIResult<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let body = res.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown error").to_string()
            } else {
                body
            }
        });

    debug!("Upstream returned {}: {}", status, message);
    Err(OpenAIError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn json_body(res: Response) -> OpenAIResult<Value> {
    let res = check_status(res).await?;
    let bytes = res.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| OpenAIError::Decode(e.to_string()))
}

struct ChunkDecodeState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<SseFrame>,
    finished: bool,
}

fn decode_chunks<S>(body: S) -> impl Stream<Item = OpenAIResult<Value>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = ChunkDecodeState {
        body: body.boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                match frame {
                    SseFrame::Done => return None,
                    SseFrame::Data(data) => match serde_json::from_str::<Value>(&data) {
                        Ok(chunk) => return Some((Ok(chunk), state)),
                        Err(e) => {
                            warn!("Skipping undecodable stream chunk: {}", e);
                            continue;
                        }
                    },
                }
            }

            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let frames = state.decoder.push(&bytes);
                    state.pending.extend(frames);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(OpenAIError::Transport(e)), state));
                }
                None => {
                    state.finished = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    })
}
