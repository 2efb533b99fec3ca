//! SSE Frame Codec
//!
//! Incremental decoder for `text/event-stream` bodies. Bytes arrive in
//! arbitrary chunks from the HTTP client; the codec buffers them and yields
//! complete frames (separated by blank lines) as they become available.
//!
//! Field handling per the SSE specification:
//! - `event:` sets the frame's event type
//! - `data:` lines accumulate, joined with `\n`
//! - `id:` is captured but unused by this daemon
//! - lines starting with `:` are comments and are ignored
//! - both LF and CRLF line endings are accepted

/// One decoded SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Event type from the `event:` field, if any.
    pub event: Option<String>,
    /// Concatenated `data:` payload; empty for keep-alive frames.
    pub data: String,
    /// Last `id:` field, if any.
    pub id: Option<String>,
}

impl SseFrame {
    /// The effective event type; the SSE default type is `message`.
    #[must_use]
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseCodec {
    buffer: String,
}

impl SseCodec {
    /// Create a new codec with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every frame completed by it.
    ///
    /// Invalid UTF-8 sequences are replaced; the upstream protocol is text.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        // A frame is complete once a blank line (double newline) arrives.
        loop {
            let Some((boundary, skip)) = find_frame_boundary(&self.buffer) else {
                break;
            };
            let raw: String = self.buffer.drain(..boundary + skip).collect();
            if let Some(frame) = parse_frame(&raw[..boundary]) {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Locate the first blank-line separator, returning (offset, separator len).
fn find_frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Parse one raw frame. Returns `None` for comment-only frames.
fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_field = false;

    for line in raw.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                frame.event = Some(value.to_string());
                saw_field = true;
            }
            "data" => {
                data_lines.push(value);
                saw_field = true;
            }
            "id" => {
                frame.id = Some(value.to_string());
                saw_field = true;
            }
            // `retry` and unknown fields are ignored.
            _ => {}
        }
    }

    if !saw_field {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_complete_frame() {
        let mut codec = SseCodec::new();
        let frames = codec.feed(b"event: STATUS\ndata: {\"a\":1}\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("STATUS"));
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn frames_split_across_chunks_decode_identically() {
        let whole = b"event: NOTIFY\ndata: {\"items\":[]}\nid: 7\n\n";
        let mut reference = SseCodec::new();
        let expected = reference.feed(whole);

        for split in 1..whole.len() {
            let mut codec = SseCodec::new();
            let mut frames = codec.feed(&whole[..split]);
            frames.extend(codec.feed(&whole[split..]));
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut codec = SseCodec::new();
        let frames = codec.feed(b"event: A\ndata: 1\n\nevent: B\ndata: 2\n\n");

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("A"));
        assert_eq!(frames[1].event.as_deref(), Some("B"));
    }

    #[test]
    fn keep_alive_frame_has_empty_data() {
        let mut codec = SseCodec::new();
        let frames = codec.feed(b"event: KEEP-ALIVE\ndata:\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("KEEP-ALIVE"));
        assert!(frames[0].data.is_empty());
    }

    #[test]
    fn crlf_line_endings() {
        let mut codec = SseCodec::new();
        let frames = codec.feed(b"event: STATUS\r\ndata: {}\r\n\r\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("STATUS"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn comment_only_frames_are_suppressed() {
        let mut codec = SseCodec::new();
        let frames = codec.feed(b": keep the connection warm\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut codec = SseCodec::new();
        let frames = codec.feed(b"data: first\ndata: second\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "first\nsecond");
        assert_eq!(frames[0].event_type(), "message");
    }

    #[test]
    fn incomplete_frame_stays_buffered() {
        let mut codec = SseCodec::new();
        assert!(codec.feed(b"event: STATUS\ndata: {").is_empty());
        let frames = codec.feed(b"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
    }
}
