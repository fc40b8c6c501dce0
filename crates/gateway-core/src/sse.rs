use bytes::{Buf, BytesMut};

use crate::events::StreamEvent;

/// One dispatched Server-Sent Events frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn to_event(&self) -> serde_json::Result<StreamEvent> {
        StreamEvent::from_frame(&self.event, &self.data)
    }
}

/// Incremental SSE decoder.
///
/// Bytes may arrive split at any point, including inside a multi-byte
/// character; only complete lines are interpreted. Comment lines (`:` prefix,
/// used for keep-alives) and unknown fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: BytesMut,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(self.scanned + offset);
            self.buf.advance(1);
            self.scanned = 0;
            let text = String::from_utf8_lossy(&raw);
            let line: &str = text.strip_suffix('\r').unwrap_or(text.as_ref());

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        self.scanned = self.buf.len();

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".into()),
            data,
        })
    }
}

/// Decode a complete SSE body into canonical events, skipping frames that do
/// not describe one.
pub fn decode_events(body: &[u8]) -> Vec<StreamEvent> {
    let mut decoder = SseDecoder::new();
    decoder
        .push(body)
        .iter()
        .filter_map(|f| f.to_event().ok())
        .collect()
}
