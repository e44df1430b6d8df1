//! Incremental server-sent-events codec.
//!
//! Upstream bodies arrive as arbitrary byte chunks; the decoder buffers
//! partial lines and yields complete events in arrival order. The encoder
//! produces the canonical client framing (`data: <json>\n\n`).

use bytes::Bytes;

pub const DONE_DATA: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_DATA
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.decode_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn decode_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.flush_event(&mut events);
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = field_value(&line, "event") {
                self.event_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                continue;
            }
            if let Some(value) = field_value(&line, "data") {
                self.data_lines.push(value.to_string());
            }
        }

        events
    }

    /// Drain whatever is left at EOF; some upstreams omit the final blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = field_value(&line, "event") {
                self.event_name = Some(value.to_string());
            } else if let Some(value) = field_value(&line, "data") {
                self.data_lines.push(value.to_string());
            }
        }
        let mut events = Vec::new();
        self.flush_event(&mut events);
        events
    }

    fn flush_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event_name.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    if line == field {
        return Some("");
    }
    let value = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Encode one client-bound frame. Multi-line data gets one `data:` per line.
pub fn encode_frame(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode_str("data: {\"a\":").is_empty());
        let events = decoder.decode_str("1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn named_events_and_comments() {
        let mut decoder = SseDecoder::new();
        let events =
            decoder.decode_str(": keepalive\nevent: message_start\ndata: {}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert!(events[1].is_done());
    }

    #[test]
    fn multiline_data_joined() {
        let mut decoder = SseDecoder::new();
        let events = decoder.decode_str("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode_str("data: tail").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn encode_matches_canonical_framing() {
        assert_eq!(
            encode_frame(None, "{\"x\":1}"),
            Bytes::from_static(b"data: {\"x\":1}\n\n")
        );
        assert_eq!(
            encode_frame(Some("ping"), "{}"),
            Bytes::from_static(b"event: ping\ndata: {}\n\n")
        );
    }
}
