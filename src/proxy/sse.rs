//! Streaming Server-Sent-Events frame reassembly.
//!
//! An SSE frame is a run of lines terminated by a blank line; lines starting
//! with `data:` contribute to the frame payload, `event:` labels and
//! comments are skipped. The parser is fed raw byte chunks as they arrive
//! and yields completed frame payloads; partial frames survive across
//! chunk boundaries.

/// Incremental SSE parser. Feed bytes in with [`SseParser::push`]; call
/// [`SseParser::finish`] at end of stream to flush a final unterminated
/// frame.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the payloads of any frames completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        // Split the buffer on '\n', retaining the trailing incomplete line.
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    frames.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // event: labels, retry:, id:, and comment lines are skipped.
        }
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        // A trailing data line without its newline still counts.
        if let Some(rest) = String::from_utf8_lossy(&self.buf)
            .trim_end_matches('\r')
            .strip_prefix("data:")
        {
            self.data_lines
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        self.buf.clear();
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame() {
        let mut p = SseParser::new();
        let frames = p.push(b"data: {\"x\":1}\n\n");
        assert_eq!(frames, vec!["{\"x\":1}".to_string()]);
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.push(b"data: {\"jsonrpc\":").is_empty());
        assert!(p.push(b"\"2.0\",\"id\":42}\n").is_empty());
        let frames = p.push(b"\n");
        assert_eq!(frames, vec!["{\"jsonrpc\":\"2.0\",\"id\":42}".to_string()]);
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut p = SseParser::new();
        let frames = p.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn event_labels_and_comments_skipped() {
        let mut p = SseParser::new();
        let frames = p.push(b"event: message\n: keepalive\ndata: payload\n\n");
        assert_eq!(frames, vec!["payload".to_string()]);
    }

    #[test]
    fn crlf_line_endings() {
        let mut p = SseParser::new();
        let frames = p.push(b"data: hi\r\n\r\n");
        assert_eq!(frames, vec!["hi".to_string()]);
    }

    #[test]
    fn multiple_frames_one_chunk() {
        let mut p = SseParser::new();
        let frames = p.push(b"data: a\n\ndata: b\n\n");
        assert_eq!(frames, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut p = SseParser::new();
        assert!(p.push(b"\n\n\n").is_empty());
        assert!(p.finish().is_none());
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut p = SseParser::new();
        assert!(p.push(b"data: tail").is_empty());
        assert_eq!(p.finish(), Some("tail".to_string()));
    }

    #[test]
    fn data_without_space_accepted() {
        let mut p = SseParser::new();
        let frames = p.push(b"data:compact\n\n");
        assert_eq!(frames, vec!["compact".to_string()]);
    }
}
