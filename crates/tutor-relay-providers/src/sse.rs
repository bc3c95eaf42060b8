//! Generic SSE (Server-Sent Events) line parser.
//!
//! Converts a response body into a `Stream<Item = SseEvent>`. Lines are split
//! on raw bytes so multi-byte characters split across network chunks survive.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    parse_sse_bytes(response.bytes_stream())
}

/// Parse any byte stream as SSE.
pub fn parse_sse_bytes<S, E>(byte_stream: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let byte_stream: ByteStream = Box::pin(
        byte_stream.map(|chunk| chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {e}"))),
    );

    futures::stream::unfold(
        SseState {
            byte_stream,
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
        },
        |mut state| async move {
            loop {
                if let Some(newline_pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        // Blank line dispatches the pending event
                        if let Some(event) = state.take_event() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("id:") {
                        state.current_id = Some(value.trim_start().to_string());
                    }
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), state)),
                    None => {
                        // Stream ended; an unterminated last line still counts
                        if !state.buffer.is_empty() {
                            let rest = String::from_utf8_lossy(&state.buffer).into_owned();
                            state.buffer.clear();
                            if let Some(value) = rest.trim_end_matches('\r').strip_prefix("data:") {
                                state.current_data.push(value.trim_start().to_string());
                            }
                        }
                        return state.take_event().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

struct SseState {
    byte_stream: ByteStream,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
}

impl SseState {
    fn take_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: Vec<&'static [u8]>) -> Vec<SseEvent> {
        let source = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c))),
        );
        let stream = parse_sse_bytes(source);
        tokio::pin!(stream);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let events = collect(vec![b"data: {\"a\"", b":1}\n\nevent: done\ndata: [DONE]\n", b"\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].event.as_deref(), Some("done"));
        assert_eq!(events[1].data, "[DONE]");
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_chunks() {
        // "ñ" is 0xC3 0xB1
        let events = collect(vec![b"data: ma\xC3", b"\xB1ana\n\n"]).await;
        assert_eq!(events[0].data, "mañana");
    }

    #[tokio::test]
    async fn test_comments_and_crlf() {
        let events = collect(vec![b": keepalive\r\ndata: one\r\ndata: two\r\n\r\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[tokio::test]
    async fn test_unterminated_final_event() {
        let events = collect(vec![b"data: tail"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }
}
