use serde_json::Value;

/// Upstream frames terminate with this sentinel line.
pub const DONE_FRAME: &str = "data: [DONE]";
pub const DONE_TOKEN: &str = "[DONE]";
pub const DATA_PREFIX: &str = "data: ";

/// Cap on bytes buffered while waiting for a newline. An upstream that
/// streams forever without a line break is a protocol violation, not a
/// reason to exhaust memory.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("frame exceeded {limit} bytes without a newline")]
    FrameTooLong { limit: usize },
}

/// Reassembles newline-delimited frames from arbitrarily split byte chunks.
///
/// Chunks carry no boundary guarantee: one chunk may hold zero, one, or many
/// complete frames, or a fragment of one. `feed` appends the chunk to an
/// internal buffer and drains every complete line; the trailing remainder
/// stays buffered for the next call. A non-empty remainder at end-of-input is
/// a truncated frame and is dropped by the caller, never force-flushed.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: Vec<u8>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, SseError> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            self.buf.pop(); // the newline itself
            let line = std::mem::replace(&mut self.buf, rest);
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        if self.buf.len() > MAX_FRAME_BYTES {
            return Err(SseError::FrameTooLong {
                limit: MAX_FRAME_BYTES,
            });
        }
        Ok(lines)
    }

    /// Bytes still waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug)]
pub enum SseEvent {
    /// Nothing to emit for this line (blank, or a tolerated fragment).
    Skip,
    /// The upstream signalled end of stream.
    End,
    /// One decoded record, ready to forward.
    Payload(Value),
}

/// Classifies one complete frame line.
///
/// Frames are already newline-complete, so a payload that parses as
/// incomplete JSON (serde's EOF class) means the upstream split a value
/// across lines; such a fragment cannot be repaired and is skipped rather
/// than failing the stream. Any other parse failure is a hard decode error
/// for the caller to log and drop.
pub fn decode_event(line: &str) -> Result<SseEvent, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if trimmed == DONE_FRAME {
        return Ok(SseEvent::End);
    }
    let payload = trimmed.strip_prefix(DATA_PREFIX).unwrap_or(trimmed).trim();
    // Tolerate upstream variants that send the sentinel without a prefix.
    if payload == DONE_TOKEN {
        return Ok(SseEvent::End);
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(value) => Ok(SseEvent::Payload(value)),
        Err(e) if e.is_eof() => Ok(SseEvent::Skip),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_all(reassembler: &mut FrameReassembler, chunks: &[&[u8]]) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(reassembler.feed(chunk).unwrap());
        }
        lines
    }

    #[test]
    fn single_chunk_multiple_lines() {
        let mut r = FrameReassembler::new();
        let lines = r.feed(b"a\nb\nc\n").unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn fragment_held_until_newline_arrives() {
        let mut r = FrameReassembler::new();
        assert!(r.feed(b"data: {\"id\"").unwrap().is_empty());
        assert!(r.feed(b":1}").unwrap().is_empty());
        let lines = r.feed(b"\n").unwrap();
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
    }

    #[test]
    fn reassembly_is_split_invariant() {
        let transcript = b"data: {\"id\":1}\ndata: {\"id\":2}\n\ndata: [DONE]\n";
        let mut whole = FrameReassembler::new();
        let expected = whole.feed(transcript).unwrap();

        for split in 0..=transcript.len() {
            let (a, b) = transcript.split_at(split);
            let mut r = FrameReassembler::new();
            assert_eq!(
                feed_all(&mut r, &[a, b]),
                expected,
                "split at byte {split} changed the line sequence"
            );
        }
    }

    #[test]
    fn trailing_fragment_stays_buffered() {
        let mut r = FrameReassembler::new();
        let lines = r.feed(b"complete\npartial").unwrap();
        assert_eq!(lines, vec!["complete"]);
        assert_eq!(r.pending(), "partial".len());
    }

    #[test]
    fn oversized_fragment_is_a_protocol_error() {
        let mut r = FrameReassembler::new();
        let big = vec![b'x'; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            r.feed(&big),
            Err(SseError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn blank_line_skipped() {
        assert!(matches!(decode_event(""), Ok(SseEvent::Skip)));
        assert!(matches!(decode_event("   \r"), Ok(SseEvent::Skip)));
    }

    #[test]
    fn sentinel_ends_stream() {
        assert!(matches!(decode_event("data: [DONE]"), Ok(SseEvent::End)));
        assert!(matches!(decode_event("  data: [DONE]  "), Ok(SseEvent::End)));
        assert!(matches!(decode_event("[DONE]"), Ok(SseEvent::End)));
    }

    #[test]
    fn prefixed_payload_decodes() {
        let ev = decode_event("data: {\"id\":1}").unwrap();
        match ev {
            SseEvent::Payload(v) => assert_eq!(v, json!({"id": 1})),
            other => panic!("expected payload, got {other:?}"),
        }
    }

    #[test]
    fn unprefixed_payload_decodes() {
        let ev = decode_event("{\"id\":2}").unwrap();
        match ev {
            SseEvent::Payload(v) => assert_eq!(v, json!({"id": 2})),
            other => panic!("expected payload, got {other:?}"),
        }
    }

    #[test]
    fn truncated_json_is_recoverable() {
        assert!(matches!(decode_event("data: {\"a\":1"), Ok(SseEvent::Skip)));
    }

    #[test]
    fn truncated_then_completed_lines_are_not_merged() {
        // A value wrongly split across two frames never reassembles; each
        // line stands alone.
        assert!(matches!(decode_event("data: {\"a\":1"), Ok(SseEvent::Skip)));
        assert!(decode_event(",\"b\":2}").is_err());
    }

    #[test]
    fn malformed_json_is_a_hard_error() {
        assert!(decode_event("data: {bad json}").is_err());
    }
}
