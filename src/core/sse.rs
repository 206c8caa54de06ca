//! Server-Sent Events codec: an incremental decoder that reassembles
//! `data:`/`event:`/`:`-comment frames across arbitrary byte-chunk
//! boundaries, and an encoder producing the same wire format.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

/// One decoded SSE frame. `event` is `None` for the default `message` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed raw upstream bytes via `push`; complete
/// frames (terminated by a blank line) are returned as they're assembled,
/// with any partial trailing line held over to the next `push` call.
#[derive(Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes and returns every complete frame it produces.
    /// Incomplete trailing data is retained internally.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let newline_pos = self.buffer.iter().position(|&b| b == b'\n');
            let Some(pos) = newline_pos else { break };

            let line_bytes = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line_bytes[..pos]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !self.pending_data.is_empty() || self.pending_event.is_some() {
                    frames.push(SseFrame {
                        event: self.pending_event.take(),
                        data: self.pending_data.join("\n"),
                    });
                    self.pending_data.clear();
                }
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.pending_event = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.pending_data.push(rest.trim_start().to_string());
            }
        }

        frames
    }
}

/// Sentinel payload marking the end of a completion stream.
pub const DONE: &str = "[DONE]";

/// Builds the `data: <json>\n\n` frame for one streamed chunk.
pub fn encode_data<T: Serialize>(payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {}\n\n", json))
}

/// Builds a named-event frame: `event: <name>\ndata: <json>\n\n`.
pub fn encode_event<T: Serialize>(name: &str, payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", name, json))
}

/// Builds a `:`-prefixed comment frame used as a keep-alive heartbeat.
pub fn encode_heartbeat() -> Bytes {
    Bytes::from_static(b": heartbeat\n\n")
}

/// Builds the terminal `data: [DONE]\n\n` frame.
pub fn encode_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Parses a frame's `data` field as JSON, returning `None` for the `[DONE]`
/// sentinel.
pub fn parse_data(frame: &SseFrame) -> Option<Value> {
    if frame.data == DONE {
        return None;
    }
    serde_json::from_str(&frame.data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_single_complete_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, r#"{"a":1}"#);
    }

    #[test]
    fn decodes_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let mut frames = decoder.push(b"data: {\"a\"");
        assert!(frames.is_empty());
        frames = decoder.push(b":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, r#"{"a":1}"#);
    }

    #[test]
    fn decodes_frame_split_mid_newline() {
        let mut decoder = SseDecoder::new();
        let mut frames = decoder.push(b"data: hello\n");
        assert!(frames.is_empty());
        frames = decoder.push(b"\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn ignores_comment_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": heartbeat\n\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn decodes_named_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: error\ndata: {\"msg\":\"boom\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("error"));
    }

    #[test]
    fn joins_multiline_data_fields() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn handles_multiple_frames_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: a\n\ndata: b\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "a");
        assert_eq!(frames[1].data, "b");
    }

    #[test]
    fn encode_data_round_trips_through_decoder() {
        let bytes = encode_data(&json!({"x": 1}));
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(parse_data(&frames[0]), Some(json!({"x": 1})));
    }

    #[test]
    fn parse_data_returns_none_for_done_sentinel() {
        let frame = SseFrame {
            event: None,
            data: "[DONE]".to_string(),
        };
        assert_eq!(parse_data(&frame), None);
    }

    #[test]
    fn encode_done_matches_sentinel_wire_format() {
        assert_eq!(&encode_done()[..], b"data: [DONE]\n\n");
    }
}
