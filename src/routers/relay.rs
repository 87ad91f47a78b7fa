//! Turn a session subscription into an SSE response body
//!
//! Both relays end when the subscription ends, on a terminal event or when the
//! deadline passes, whichever comes first. The deadline is armed independently of
//! message arrival, so a silent channel still times out. Dropping the body (client
//! disconnect) drops the subscription.

use std::pin::Pin;
use std::time::Duration;

use actix_web::Error;
use bytes::Bytes;
use futures::stream::Stream;
use futures_util::StreamExt;
use tokio::time::Sleep;
use tracing::debug;

use crate::broker::Subscription;
use crate::protocols::openai::{ChatCompletionStreamResponse, ErrorResponse};
use crate::tasks::StreamEvent;

struct RelayState {
    subscription: Subscription,
    deadline: Pin<Box<Sleep>>,
    done: bool,
}

impl RelayState {
    fn new(subscription: Subscription, timeout: Duration) -> Self {
        Self {
            subscription,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            done: false,
        }
    }
}

enum Next {
    Payload(String),
    Closed,
    TimedOut,
}

async fn next_payload(state: &mut RelayState) -> Next {
    tokio::select! {
        biased;
        payload = state.subscription.next() => match payload {
            Some(payload) => Next::Payload(payload),
            None => Next::Closed,
        },
        _ = &mut state.deadline => Next::TimedOut,
    }
}

fn sse_data(data: &str) -> Bytes {
    Bytes::from(format!("data: {}\n\n", data))
}

/// Whether a raw payload is an event the relay stops after
fn is_terminal_payload(payload: &str) -> bool {
    serde_json::from_str::<StreamEvent>(payload).is_ok_and(|event| event.is_terminal())
}

/// Forward every payload verbatim as `data: {payload}`
pub fn native_events(
    subscription: Subscription,
    timeout: Duration,
) -> impl Stream<Item = Result<Bytes, Error>> {
    let state = RelayState::new(subscription, timeout);

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        match next_payload(&mut state).await {
            Next::Payload(payload) => {
                state.done = is_terminal_payload(&payload);
                Some((Ok(sse_data(&payload)), state))
            }
            Next::Closed => None,
            Next::TimedOut => {
                debug!("Stream relay timed out");
                state.done = true;
                Some((Ok(sse_data(&StreamEvent::Timeout.to_json())), state))
            }
        }
    })
}

/// Identity stamped on every chunk of one OpenAI-format stream
#[derive(Debug, Clone)]
pub struct CompletionIdentity {
    pub id: String,
    pub created: u64,
    pub model: String,
}

/// Translate session events into `chat.completion.chunk` SSE frames ending with `[DONE]`
pub fn openai_events(
    subscription: Subscription,
    identity: CompletionIdentity,
    timeout: Duration,
) -> impl Stream<Item = Result<Bytes, Error>> {
    let state = RelayState::new(subscription, timeout);

    futures::stream::unfold((state, identity), |(mut state, identity)| async move {
        loop {
            if state.done {
                return None;
            }
            let payload = match next_payload(&mut state).await {
                Next::Payload(payload) => payload,
                Next::Closed => return None,
                Next::TimedOut => {
                    state.done = true;
                    let err = ErrorResponse::new("Request timeout", "timeout_error", None);
                    return Some((Ok(sse_json(&err)), (state, identity)));
                }
            };

            let Some(frame) = translate(&payload, &identity, &mut state.done) else {
                continue;
            };
            return Some((Ok(frame), (state, identity)));
        }
    })
}

fn sse_json<T: serde::Serialize>(value: &T) -> Bytes {
    sse_data(&serde_json::to_string(value).unwrap_or_default())
}

/// `None` for events the OpenAI format has no counterpart for
fn translate(payload: &str, identity: &CompletionIdentity, done: &mut bool) -> Option<Bytes> {
    let event: StreamEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            debug!("Skipping malformed stream payload: {}", e);
            return None;
        }
    };

    match event {
        StreamEvent::Chunk { content, .. } if !content.is_empty() => {
            Some(sse_json(&ChatCompletionStreamResponse::content(
                &identity.id,
                identity.created,
                &identity.model,
                content,
            )))
        }
        StreamEvent::Complete { .. } => {
            *done = true;
            let last = ChatCompletionStreamResponse::finish(
                &identity.id,
                identity.created,
                &identity.model,
                "stop",
            );
            let mut frame = sse_json(&last).to_vec();
            frame.extend_from_slice(b"data: [DONE]\n\n");
            Some(Bytes::from(frame))
        }
        StreamEvent::Error { error } => {
            *done = true;
            Some(sse_json(&ErrorResponse::new(error, "server_error", None)))
        }
        StreamEvent::Chunk { .. } | StreamEvent::Status { .. } | StreamEvent::Timeout => None,
    }
}
