//! Newline framing for JSON-RPC over pipes.
//!
//! Pipe reads do not respect message boundaries: one read may carry half a
//! message, or three messages and the start of a fourth. [`LineBuffer`]
//! accumulates raw bytes and yields complete lines, keeping the trailing
//! partial line for the next read.

/// Upper bound on a single buffered line. A provider that never emits a
/// newline would otherwise grow the buffer without limit.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and drain every complete, non-blank line.
    ///
    /// Lines are decoded lossily and trimmed of `\r`/whitespace.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buf[start..end]);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            start = end + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > MAX_LINE_BYTES {
            tracing::warn!(
                "[LineBuffer] Dropping {} bytes without a newline",
                self.buf.len()
            );
            self.buf.clear();
        }

        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Flush whatever is left when the stream ends (a final line without `\n`).
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_multiple_lines_in_one_chunk() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_rebuffers_partial_line() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"jsonrpc\":\"2.0\",").is_empty());
        assert!(buf.pending() > 0);
        let lines = buf.push(b"\"id\":1}\n{\"id\"");
        assert_eq!(lines, vec!["{\"jsonrpc\":\"2.0\",\"id\":1}"]);
        let lines = buf.push(b":2}\n");
        assert_eq!(lines, vec!["{\"id\":2}"]);
    }

    #[test]
    fn test_handles_crlf_and_blank_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"one\r\n\r\n\ntwo\r\n");
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_finish_returns_trailing_line() {
        let mut buf = LineBuffer::new();
        buf.push(b"done\nlast");
        assert_eq!(buf.finish().as_deref(), Some("last"));
        assert_eq!(buf.finish(), None);
    }
}
