//! Reassembly of logical messages from BLE notification chunks.
//!
//! Framing is brace-depth based: a message is either a balanced `{...}` block
//! or a bare token outside any block. String literals inside a block are
//! tracked so braces in string values do not affect the depth. Outside a
//! block, whitespace, commas, brackets and stray `}` separate tokens; known
//! control tokens are emitted as soon as their last byte arrives.
//!
//! A bare `END` (outside string literals) terminates the stream wherever it
//! appears. Whatever was buffered before it is flushed as one implicit
//! message, then `END` is emitted, and all further input is ignored until
//! [`FrameReassembler::reset`] is called.
//!
//! The reassembler is a byte-at-a-time state machine, so the messages produced
//! never depend on where the chunk boundaries fall.

use crate::measurement::types::SessionConfig;
use crate::sensors::protocol::{CONTROL_TOKENS, END_TOKEN};

const WORD_TRACK_LEN: usize = 16;

/// A complete logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Brace-delimited block, braces included
    Record(String),
    /// Bare token found outside any block
    Token(String),
}

impl Frame {
    pub fn as_str(&self) -> &str {
        match self {
            Frame::Record(text) | Frame::Token(text) => text,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Frame::Token(t) if t == END_TOKEN)
    }
}

/// Accumulates notification payloads and extracts complete messages.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Trailing run of bare word bytes, for END detection
    word: Vec<u8>,
    overflowed: bool,
    terminated: bool,
    max_message_bytes: usize,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(SessionConfig::default().max_message_bytes)
    }
}

impl FrameReassembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            word: Vec::with_capacity(WORD_TRACK_LEN),
            overflowed: false,
            terminated: false,
            max_message_bytes: max_message_bytes.max(END_TOKEN.len() + 2),
        }
    }

    /// Feed one chunk, returning every message it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        if self.terminated {
            if !chunk.is_empty() {
                tracing::debug!("Ignoring {} bytes after END", chunk.len());
            }
            return frames;
        }

        for &byte in chunk {
            if self.depth > 0 {
                self.push_block_byte(byte, &mut frames);
            } else {
                self.push_bare_byte(byte, &mut frames);
            }

            if self.terminated {
                break;
            }
        }

        frames
    }

    /// Drop any partial message and accept input again.
    pub fn reset(&mut self) {
        self.clear_message();
        self.terminated = false;
    }

    /// Whether END was seen since the last reset.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Whether an incomplete message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty() || self.depth > 0
    }

    /// Bytes currently held for the incomplete message.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn push_block_byte(&mut self, byte: u8, frames: &mut Vec<Frame>) {
        self.append(byte);

        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return;
        }

        match byte {
            b'"' => {
                self.in_string = true;
                self.word.clear();
            }
            b'{' => {
                self.depth += 1;
                self.word.clear();
            }
            b'}' => {
                self.depth -= 1;
                self.word.clear();
                if self.depth == 0 {
                    if self.overflowed {
                        tracing::warn!("Dropped record larger than {} bytes", self.max_message_bytes);
                    } else {
                        frames.push(Frame::Record(self.take_text()));
                    }
                    self.clear_message();
                }
            }
            b if is_word_byte(b) => {
                self.track_word(b);
                if self.word.ends_with(END_TOKEN.as_bytes()) {
                    self.terminate(frames, Frame::Record);
                }
            }
            _ => self.word.clear(),
        }
    }

    fn push_bare_byte(&mut self, byte: u8, frames: &mut Vec<Frame>) {
        if is_word_byte(byte) {
            self.append(byte);
            self.track_word(byte);

            if self.word.ends_with(END_TOKEN.as_bytes()) {
                self.terminate(frames, Frame::Token);
            } else if !self.overflowed && CONTROL_TOKENS.iter().any(|t| t.as_bytes() == self.buffer) {
                frames.push(Frame::Token(self.take_text()));
                self.clear_message();
            }
            return;
        }

        self.flush_token(frames);

        match byte {
            b'{' => {
                self.append(byte);
                self.depth = 1;
            }
            b'}' => tracing::debug!("Stray closing brace outside a record"),
            _ => {}
        }
    }

    /// Emit a pending bare token, if any.
    fn flush_token(&mut self, frames: &mut Vec<Frame>) {
        if self.overflowed {
            tracing::warn!("Dropped token larger than {} bytes", self.max_message_bytes);
        } else if !self.buffer.is_empty() {
            frames.push(Frame::Token(self.take_text()));
        }
        self.clear_message();
    }

    /// Handle END: flush the buffered prefix, emit END and stop.
    fn terminate(&mut self, frames: &mut Vec<Frame>, prefix_frame: fn(String) -> Frame) {
        if !self.overflowed {
            let keep = self.buffer.len().saturating_sub(END_TOKEN.len());
            self.buffer.truncate(keep);
            let prefix = self.take_text();
            if !prefix.trim().is_empty() {
                frames.push(prefix_frame(prefix));
            }
        }
        frames.push(Frame::Token(END_TOKEN.to_string()));
        self.clear_message();
        self.terminated = true;
        tracing::debug!("END received, stream terminated");
    }

    fn append(&mut self, byte: u8) {
        if self.overflowed {
            return;
        }
        if self.buffer.len() >= self.max_message_bytes {
            self.overflowed = true;
            self.buffer.clear();
            return;
        }
        self.buffer.push(byte);
    }

    fn track_word(&mut self, byte: u8) {
        if self.word.len() == WORD_TRACK_LEN {
            self.word.remove(0);
        }
        self.word.push(byte);
    }

    fn take_text(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        text
    }

    fn clear_message(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.word.clear();
        self.overflowed = false;
    }
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str) -> Frame {
        Frame::Record(text.to_string())
    }

    fn token(text: &str) -> Frame {
        Frame::Token(text.to_string())
    }

    #[test]
    fn test_single_record() {
        let mut r = FrameReassembler::default();
        let frames = r.feed(br#"{"id":"MASTER","idx":0,"angle":12.5,"time":10}"#);
        assert_eq!(frames, vec![record(r#"{"id":"MASTER","idx":0,"angle":12.5,"time":10}"#)]);
        assert!(!r.has_partial());
    }

    #[test]
    fn test_partial_record_retained() {
        let mut r = FrameReassembler::default();
        assert!(r.feed(br#"{"id":"MAS"#).is_empty());
        assert!(r.has_partial());

        let frames = r.feed(br#"TER","idx":1}"#);
        assert_eq!(frames, vec![record(r#"{"id":"MASTER","idx":1}"#)]);
        assert!(!r.has_partial());
    }

    #[test]
    fn test_multiple_records_in_one_chunk() {
        let mut r = FrameReassembler::default();
        let frames = r.feed(br#"{"idx":0}{"idx":1} , {"idx":2}"#);
        assert_eq!(frames, vec![record(r#"{"idx":0}"#), record(r#"{"idx":1}"#), record(r#"{"idx":2}"#)]);
    }

    #[test]
    fn test_array_wrapper_is_ignored() {
        let mut r = FrameReassembler::default();
        let frames = r.feed(br#"[{"idx":0},{"idx":1}]"#);
        assert_eq!(frames, vec![record(r#"{"idx":0}"#), record(r#"{"idx":1}"#)]);
    }

    #[test]
    fn test_nested_and_string_braces() {
        let mut r = FrameReassembler::default();
        let text = r#"{"id":"a}b{","meta":{"x":1},"note":"say \"END\""}"#;
        let frames = r.feed(text.as_bytes());
        assert_eq!(frames, vec![record(text)]);
        assert!(!r.is_terminated());
    }

    #[test]
    fn test_end_token_alone() {
        let mut r = FrameReassembler::default();
        assert_eq!(r.feed(b"END"), vec![token("END")]);
        assert!(r.is_terminated());
    }

    #[test]
    fn test_end_split_across_chunks() {
        let mut r = FrameReassembler::default();
        assert!(r.feed(b"E").is_empty());
        assert!(r.feed(b"N").is_empty());
        assert_eq!(r.feed(b"D"), vec![token("END")]);
    }

    #[test]
    fn test_end_after_records() {
        let mut r = FrameReassembler::default();
        let frames = r.feed(br#"{"idx":0}{"idx":1}END"#);
        assert_eq!(frames, vec![record(r#"{"idx":0}"#), record(r#"{"idx":1}"#), token("END")]);
    }

    #[test]
    fn test_end_inside_open_block_flushes_prefix() {
        let mut r = FrameReassembler::default();
        assert!(r.feed(br#"{"idx":3,"angle":4"#).is_empty());
        let frames = r.feed(b"END");
        assert_eq!(frames, vec![record(r#"{"idx":3,"angle":4"#), token("END")]);
        assert!(!r.has_partial());
    }

    #[test]
    fn test_input_ignored_until_reset() {
        let mut r = FrameReassembler::default();
        let frames = r.feed(br#"END{"idx":9}"#);
        assert_eq!(frames, vec![token("END")]);
        assert!(r.feed(br#"{"idx":10}"#).is_empty());

        r.reset();
        assert_eq!(r.feed(br#"{"idx":10}"#), vec![record(r#"{"idx":10}"#)]);
    }

    #[test]
    fn test_status_tokens_emitted_eagerly() {
        let mut r = FrameReassembler::default();
        assert!(r.feed(b"SLAVE_").is_empty());
        assert_eq!(r.feed(b"OK"), vec![token("SLAVE_OK")]);
        assert_eq!(r.feed(b"SLAVE_ERROR"), vec![token("SLAVE_ERROR")]);
        assert!(!r.is_terminated());
    }

    #[test]
    fn test_unknown_token_delimited_by_whitespace() {
        let mut r = FrameReassembler::default();
        assert!(r.feed(b"HELLO").is_empty());
        assert_eq!(r.feed(b"\n"), vec![token("HELLO")]);
    }

    #[test]
    fn test_reset_drops_partial() {
        let mut r = FrameReassembler::default();
        r.feed(br#"{"idx":"#);
        r.reset();
        assert!(!r.has_partial());
        assert_eq!(r.feed(br#"{"idx":2}"#), vec![record(r#"{"idx":2}"#)]);
    }

    #[test]
    fn test_oversized_record_dropped_and_stream_resyncs() {
        let mut r = FrameReassembler::new(16);
        let frames = r.feed(br#"{"note":"this is far too long"}{"idx":1}"#);
        assert_eq!(frames, vec![record(r#"{"idx":1}"#)]);
    }

    #[test]
    fn test_utf8_split_inside_record() {
        let text = "{\"id\":\"MÁSTER\"}";
        let bytes = text.as_bytes();
        let split = text.find('Á').unwrap() + 1; // middle of the two-byte char

        let mut r = FrameReassembler::default();
        assert!(r.feed(&bytes[..split]).is_empty());
        assert_eq!(r.feed(&bytes[split..]), vec![record(text)]);
    }

    #[test]
    fn test_split_invariance_every_boundary() {
        let stream = br#"SLAVE_OK {"id":"MASTER","idx":0,"angle":1.5,"time":0}{"id":"SLAVE","idx":0,"angle":"x}"}garbage{"idx":1}END"#;

        let expected = FrameReassembler::default().feed(stream);
        assert_eq!(expected.last(), Some(&token("END")));

        for split in 0..=stream.len() {
            let mut r = FrameReassembler::default();
            let mut frames = r.feed(&stream[..split]);
            frames.extend(r.feed(&stream[split..]));
            assert_eq!(frames, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_whole() {
        let stream = br#"{"idx":0,"angle":10}{"idx":1,"angle":20}SLAVE_ERROR{"idx":2}"#;
        let expected = FrameReassembler::default().feed(stream);

        let mut r = FrameReassembler::default();
        let frames: Vec<Frame> = stream.iter().flat_map(|b| r.feed(std::slice::from_ref(b))).collect();
        assert_eq!(frames, expected);
        assert_eq!(frames.len(), 4);
    }
}
