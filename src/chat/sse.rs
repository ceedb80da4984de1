// sse.rs — incremental decoder for `text/event-stream` bodies
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(Value),
    /// `data: [DONE]`
    Done,
}

/// Splits arbitrary byte chunks into complete lines and decodes `data:` lines.
/// Bytes of an incomplete trailing line (including a partial UTF-8 sequence)
/// are kept until the next chunk.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = decode_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line).into_iter().collect()
    }
}

fn decode_line(raw: &[u8]) -> Option<SseFrame> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseFrame::Done);
    }
    match serde_json::from_str(payload) {
        Ok(json) => Some(SseFrame::Data(json)),
        Err(e) => {
            log::warn!("skipping malformed SSE line ({}): {}", e, payload);
            None
        }
    }
}
