//! Server-sent-event framing for the streaming Messages endpoint.
//!
//! Splits a byte stream on blank lines, collects `event:` / `data:` fields,
//! and yields one `SseEvent` per frame. `[DONE]` frames and comment lines
//! are dropped here so the decoder above only sees real events.

use futures::stream::{BoxStream, StreamExt};

use crate::errors::LlmError;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse one `event:`/`data:` frame. Returns `None` for keep-alives,
/// comments, and the `[DONE]` sentinel.
pub fn parse_frame(text: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data_lines = Vec::new();

    for line in text.lines() {
        if let Some(value) = line.strip_prefix("event: ") {
            event_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("data: ") {
            data_lines.push(value);
        } else if line == "data:" {
            data_lines.push("");
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    let data = data_lines.join("\n");
    if data == "[DONE]" {
        return None;
    }

    Some(SseEvent {
        event: event_type,
        data,
    })
}

/// Turn a reqwest byte stream into a stream of SSE frames.
pub fn frame_stream(
    bytes: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> BoxStream<'static, Result<SseEvent, LlmError>> {
    let stream = futures::stream::unfold(
        (Box::pin(bytes), String::new()),
        |(mut bytes, mut buffer)| async move {
            loop {
                if let Some(pos) = buffer.find("\n\n") {
                    let frame_text = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    if let Some(event) = parse_frame(&frame_text) {
                        return Some((Ok(event), (bytes, buffer)));
                    }
                    continue;
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        let err = if e.is_timeout() {
                            LlmError::Timeout
                        } else {
                            LlmError::Transport(e.to_string())
                        };
                        return Some((Err(err), (bytes, buffer)));
                    }
                    None => return None,
                }
            }
        },
    );
    Box::pin(stream)
}
