//! Incremental UTF-8 decoding and CRLF line splitting.

/// Line delimiter used by the device firmware.
pub const LINE_DELIMITER: &str = "\r\n";

/// Drain buffered bytes into text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                    output.push_str(valid);
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push(char::REPLACEMENT_CHARACTER);
                        let drain_to = valid_up_to
                            .saturating_add(invalid_len)
                            .min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        buffer.drain(..valid_up_to);
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Streaming UTF-8 decoder that carries split code points across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode a chunk, holding back an incomplete trailing sequence.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending
            .extend_from_slice(bytes);
        drain_utf8_lossy(&mut self.pending)
    }

    /// Flush the decoder; leftover bytes become replacement characters.
    pub fn finish(&mut self) -> String {
        if self
            .pending
            .is_empty()
        {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending
            .clear();
        tail
    }
}

/// Splits decoded text into CRLF-terminated lines.
///
/// Text after the last delimiter is buffered until more arrives or the
/// splitter is flushed.
#[derive(Debug, Default)]
pub struct LineSplitter {
    chunks: String,
}

impl LineSplitter {
    /// Append text and return every line it completes.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        // The buffer holds no delimiter; only its trailing `\r` can start one.
        let mut from = self
            .chunks
            .len();
        if self
            .chunks
            .ends_with('\r')
        {
            from -= 1;
        }
        self.chunks
            .push_str(text);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.chunks[from..].find(LINE_DELIMITER) {
            let end = from + pos;
            lines.push(self.chunks[start..end].to_string());
            start = end + LINE_DELIMITER.len();
            from = start;
        }
        self.chunks
            .drain(..start);
        lines
    }

    /// Take the buffered residue.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.chunks)
    }

    /// Text waiting for a delimiter.
    pub fn pending(&self) -> &str {
        &self.chunks
    }
}

/// Bytes in, lines out.
#[derive(Debug, Default)]
pub struct LineDecoder {
    utf8: Utf8Decoder,
    lines: LineSplitter,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and collect completed lines.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = self
            .utf8
            .decode(bytes);
        self.lines
            .push(&text)
    }

    /// Flush both stages and return the unterminated residue.
    pub fn finish(&mut self) -> String {
        // Dangling bytes decode to replacement chars, never a delimiter.
        let tail = self
            .utf8
            .finish();
        let mut residue = self
            .lines
            .flush();
        residue.push_str(&tail);
        residue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_utf8_lossy_replaces_invalid_bytes_and_continues() {
        let mut buf = vec![0xFF, b'A', 0xFE, b'B'];
        let out = drain_utf8_lossy(&mut buf);
        assert_eq!(out, "\u{FFFD}A\u{FFFD}B");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_joins_split_code_point() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xE4, 0xBD]), "");
        assert_eq!(decoder.decode(&[0xA0, b'!']), "你!");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_finish_replaces_dangling_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'o', b'k', 0xE4]), "ok");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_splitter_emits_complete_lines_and_keeps_residue() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push("ab\r\ncd\r\nef"), vec!["ab", "cd"]);
        assert_eq!(splitter.pending(), "ef");
        assert_eq!(splitter.flush(), "ef");
        assert_eq!(splitter.pending(), "");
    }

    #[test]
    fn test_splitter_handles_delimiter_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(
            splitter
                .push("hello\r")
                .is_empty()
        );
        assert_eq!(splitter.push("\nworld\r\n"), vec!["hello", "world"]);
    }

    #[test]
    fn test_splitter_fed_one_char_at_a_time() {
        let text = "[IDENTITY] model=é\r\n\r\r\nsecond line\r\ntail";
        let mut splitter = LineSplitter::default();
        let mut lines = Vec::new();
        for ch in text.chars() {
            lines.extend(splitter.push(ch.encode_utf8(&mut [0; 4])));
        }
        assert_eq!(lines, vec!["[IDENTITY] model=é", "\r", "second line"]);
        assert_eq!(splitter.flush(), "tail");
        assert_eq!(splitter.push("x\r\n"), vec!["x"]);
    }

    #[test]
    fn test_splitter_long_line_in_many_chunks() {
        let mut splitter = LineSplitter::default();
        for _ in 0..10_000 {
            assert!(
                splitter
                    .push("ab")
                    .is_empty()
            );
        }
        let lines = splitter.push("\r\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 20_000);
        assert_eq!(splitter.pending(), "");
    }

    #[test]
    fn test_splitter_keeps_bare_newlines_inside_line() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push("a\nb\r\n"), vec!["a\nb"]);
    }

    #[test]
    fn test_splitter_emits_empty_lines() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push("\r\n\r\nx\r\n"), vec!["", "", "x"]);
    }

    #[test]
    fn test_line_decoder_finish_returns_residue() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.feed(b"[IDENTITY] model=x\r\npartial"), vec!["[IDENTITY] model=x"]);
        assert_eq!(decoder.finish(), "partial");
        assert_eq!(decoder.finish(), "");
    }
}
