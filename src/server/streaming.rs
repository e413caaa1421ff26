//! SSE streaming for token-by-token chat completions.
//!
//! Converts a channel of [`GenerationEvent`]s into OpenAI-style
//! `chat.completion.chunk` events terminated by `[DONE]`.

use std::convert::Infallible;

use axum::response::sse::Event;
use chrono::Utc;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::pipeline::GenerationEvent;

/// Streaming chat completion chunk (OpenAI-compatible).
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    fn new(request_id: &str, model: &str, delta: ChunkDelta, finish: Option<&'static str>) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            object: "chat.completion.chunk",
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
        }
    }
}

/// Map one generation event to a chunk. The first token carries the role.
pub fn event_to_chunk(
    event: GenerationEvent,
    request_id: &str,
    model: &str,
    first: &mut bool,
) -> ChatCompletionChunk {
    match event {
        GenerationEvent::Token { text, .. } => {
            let role = if std::mem::take(first) {
                Some("assistant")
            } else {
                None
            };
            let delta = ChunkDelta {
                role,
                content: Some(text),
            };
            ChatCompletionChunk::new(request_id, model, delta, None)
        }
        GenerationEvent::Done { .. } => {
            ChatCompletionChunk::new(request_id, model, ChunkDelta::default(), Some("stop"))
        }
        GenerationEvent::Error(e) => {
            let delta = ChunkDelta {
                role: None,
                content: Some(format!("[Error: {e}]")),
            };
            ChatCompletionChunk::new(request_id, model, delta, Some("error"))
        }
    }
}

/// Convert a generation event receiver into an SSE stream.
pub fn generation_to_sse_stream(
    rx: mpsc::Receiver<GenerationEvent>,
    request_id: String,
    model: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut first = true;

    ReceiverStream::new(rx)
        .map(move |event| {
            let chunk = event_to_chunk(event, &request_id, &model, &mut first);
            let data = serde_json::to_string(&chunk).unwrap_or_default();
            Ok(Event::default().data(data))
        })
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))))
}
