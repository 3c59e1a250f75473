//! Output Parser: a stateless-regarding-conversation-identity line/JSON
//! splitter plus ANSI stripping. One `LineParser` instance lives inside each
//! Session Runtime and owns only the buffering state needed to assemble
//! lines split across reads.
//!
//! The ANSI stripper is hand-rolled (no regex dependency, CSI/OSC aware)
//! since it needs to run on every line of every interactive adapter's
//! output.

use serde_json::Value;

use crate::adapters::{Adapter, ParseStrategy};
use crate::schema::ContentBlock;

/// One parsed unit: a content block plus whether it is a streaming-partial
/// record. Partial records precede the final non-partial one for the same
/// logical event.
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub block: ContentBlock,
    pub is_partial: bool,
}

impl ParsedBlock {
    pub fn whole(block: ContentBlock) -> Self {
        Self { block, is_partial: false }
    }

    pub fn partial(block: ContentBlock) -> Self {
        Self { block, is_partial: true }
    }
}

/// A chunk of raw output grows this buffer beyond which it is flushed as a
/// single `raw` block rather than grown without bound: a child emitting
/// output with no newlines is tolerated up to this size before the
/// accumulated bytes are flushed and the buffer reset.
const MAX_LINE_BUFFER: usize = 1024 * 1024;

/// Splits a byte stream into lines, tolerating partial tail bytes, and
/// dispatches each complete line to the active adapter.
pub struct LineParser {
    buffer: Vec<u8>,
    strategy: ParseStrategy,
}

impl LineParser {
    pub fn new(strategy: ParseStrategy) -> Self {
        Self { buffer: Vec::new(), strategy }
    }

    /// Feeds one chunk of raw bytes (from a PTY or stdout pipe), returning
    /// every block that can now be emitted in source order.
    pub fn feed(&mut self, chunk: &[u8], adapter: &dyn Adapter) -> Vec<ParsedBlock> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line_bytes[..line_bytes.len() - 1];
            self.dispatch_line(line, adapter, &mut out);
        }

        if self.buffer.len() > MAX_LINE_BUFFER {
            let raw = String::from_utf8_lossy(&self.buffer).to_string();
            out.push(ParsedBlock::whole(ContentBlock::Raw {
                value: serde_json::json!({ "overflow": true, "text": raw }),
            }));
            self.buffer.clear();
        }

        out
    }

    /// Call on stream close (child EOF) to flush any unterminated tail.
    pub fn flush(&mut self, adapter: &dyn Adapter) -> Vec<ParsedBlock> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.dispatch_line(&line, adapter, &mut out);
        }
        out
    }

    fn dispatch_line(&self, line_bytes: &[u8], adapter: &dyn Adapter, out: &mut Vec<ParsedBlock>) {
        let line = String::from_utf8_lossy(line_bytes);
        if line.is_empty() {
            return;
        }
        match self.strategy {
            ParseStrategy::JsonLines => match serde_json::from_str::<Value>(&line) {
                Ok(value) => out.extend(adapter.parse_json_event(&value)),
                Err(_) => {
                    let stripped = strip_ansi_escapes(&line);
                    out.push(adapter.parse_text_line(&stripped, &line));
                }
            },
            ParseStrategy::AnsiText => {
                let stripped = strip_ansi_escapes(&line);
                out.push(adapter.parse_text_line(&stripped, &line));
            }
        }
    }
}

/// Strip ANSI SGR/cursor-movement escape sequences (no regex dependency).
pub fn strip_ansi_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == ';' || c == '?' || (' '..='/').contains(&c) {
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(&c) = chars.peek() {
                    if ('@'..='~').contains(&c) {
                        chars.next();
                    }
                }
            } else if chars.peek() == Some(&']') {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            } else {
                chars.next();
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::claude::ClaudeAdapter;
    use crate::adapters::cursor_agent::CursorAgentAdapter;

    #[test]
    fn strips_csi_sgr_sequences() {
        let raw = "\x1b[32mhello\x1b[0m world";
        assert_eq!(strip_ansi_escapes(raw), "hello world");
    }

    #[test]
    fn partial_json_line_split_across_two_reads_is_assembled() {
        let adapter = ClaudeAdapter::default();
        let mut parser = LineParser::new(ParseStrategy::JsonLines);
        let full = r#"{"type":"message_stop","stop_reason":"end_turn"}"#;
        let (head, tail) = full.split_at(20);

        let first = parser.feed(head.as_bytes(), &adapter);
        assert!(first.is_empty());

        let mut second_input = tail.as_bytes().to_vec();
        second_input.push(b'\n');
        let second = parser.feed(&second_input, &adapter);
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0].block,
            ContentBlock::SessionEnd { reason: "end_turn".into(), success: true }
        );
    }

    #[test]
    fn oversized_unterminated_buffer_flushes_as_raw() {
        let adapter = CursorAgentAdapter::default();
        let mut parser = LineParser::new(ParseStrategy::AnsiText);
        let chunk = vec![b'a'; MAX_LINE_BUFFER + 1];
        let out = parser.feed(&chunk, &adapter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].block.kind(), "raw");
    }

    #[test]
    fn json_lines_strategy_falls_back_to_text_on_malformed_json() {
        let adapter = ClaudeAdapter::default();
        let mut parser = LineParser::new(ParseStrategy::JsonLines);
        let out = parser.feed(b"not actually json\n", &adapter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].block, ContentBlock::Text { content: "not actually json".into() });
    }
}
