//! Output normalization
//!
//! Captured chunks are stored comparison-ready: one trailing line terminator
//! removed and ANSI escape sequences stripped. Stdin payloads get exactly one
//! platform line terminator.

use std::sync::OnceLock;
use regex::Regex;

#[cfg(windows)]
pub const EOL: &str = "\r\n";
#[cfg(not(windows))]
pub const EOL: &str = "\n";

/// Remove a single trailing `\n` (and a `\r` before it).
pub fn strip_final_newline(s: &str) -> &str {
    match s.strip_suffix('\n') {
        Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
        None => s.strip_suffix('\r').unwrap_or(s),
    }
}

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        // CSI / OSC sequences, 7-bit (ESC) and 8-bit (0x9B) introducers
        Regex::new(concat!(
            r"[\x1B\x{9B}][\[\]()#;?]*",
            r"(?:(?:(?:(?:;[-a-zA-Z\d/#&.:=?%@~_]+)*",
            r"|[a-zA-Z\d]+(?:;[-a-zA-Z\d/#&.:=?%@~_]*)*)?\x07)",
            r"|(?:(?:\d{1,4}(?:;\d{0,4})*)?[\dA-PR-TZcf-nq-uy=><~]))",
        ))
        .expect("ANSI pattern is valid")
    })
}

/// Strip ANSI escape sequences.
pub fn strip_ansi(s: &str) -> String {
    ansi_regex().replace_all(s, "").into_owned()
}

/// Normalize a captured chunk: final newline, then ANSI codes.
pub fn clean_chunk(chunk: &str) -> String {
    strip_ansi(strip_final_newline(chunk))
}

/// Normalize a stdin payload to end with exactly one platform line terminator.
pub fn stdin_line(data: &str) -> String {
    let body = data
        .strip_suffix('\n')
        .map(|rest| rest.strip_suffix('\r').unwrap_or(rest))
        .unwrap_or(data);
    format!("{}{}", body, EOL)
}

/// Longest escape sequence held back waiting for its end
const MAX_PENDING_ESCAPE: usize = 256;

/// Byte offset of an escape sequence that `text` ends in the middle of.
///
/// A sequence that runs to the very end of the text counts as unfinished,
/// since `ESC[3` may still become `ESC[31m` with the next read.
fn unfinished_escape(text: &str) -> Option<usize> {
    let start = text.rfind(|c| c == '\x1b' || c == '\u{9b}')?;
    let tail = &text[start..];
    if tail.len() > MAX_PENDING_ESCAPE {
        return None;
    }
    let body = tail.trim_start_matches(|c| c == '\x1b' || c == '\u{9b}');
    if !body.chars().all(|c| c.is_ascii_alphanumeric() || "[]()#;?/&.:=%@~_-".contains(c)) {
        return None;
    }
    if body.starts_with(']') {
        // OSC runs until BEL
        return Some(start);
    }
    match ansi_regex().find(tail) {
        Some(m) if m.start() == 0 && m.end() < tail.len() => None,
        _ => Some(start),
    }
}

/// Incremental UTF-8 decoder for pipe reads.
///
/// A multi-byte character split across two reads is held back until the
/// rest of it arrives, instead of being replaced by U+FFFD. So is an ANSI
/// escape sequence cut off at the end of a read, so that it can still be
/// stripped as a whole.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the decodable text, if any.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // error_len() == None: the tail is an incomplete sequence
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return Some(text);
            }
        };
        if valid == 0 {
            return None;
        }
        let rest = self.pending.split_off(valid);
        let mut text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        if let Some(at) = unfinished_escape(&text) {
            let mut held = text.split_off(at).into_bytes();
            held.append(&mut self.pending);
            self.pending = held;
        }
        if text.is_empty() {
            return None;
        }
        Some(text)
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_final_newline() {
        assert_eq!(strip_final_newline("hi\n"), "hi");
        assert_eq!(strip_final_newline("hi\r\n"), "hi");
        assert_eq!(strip_final_newline("hi\n\n"), "hi\n");
        assert_eq!(strip_final_newline("hi"), "hi");
        assert_eq!(strip_final_newline(""), "");
    }

    #[test]
    fn test_strip_ansi_colors() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[39m plain"), "red plain");
        assert_eq!(strip_ansi("\x1b[1;32mbold green\x1b[0m"), "bold green");
    }

    #[test]
    fn test_strip_ansi_osc_link() {
        let linked = "\x1b]8;;https://example.com\x07link\x1b]8;;\x07";
        assert_eq!(strip_ansi(linked), "link");
    }

    #[test]
    fn test_clean_chunk() {
        assert_eq!(clean_chunk("\x1b[33mwarn\x1b[0m\n"), "warn");
    }

    #[test]
    fn test_stdin_line_single_terminator() {
        assert_eq!(stdin_line("yes"), format!("yes{}", EOL));
        assert_eq!(stdin_line("yes\n"), format!("yes{}", EOL));
        assert_eq!(stdin_line("yes\r\n"), format!("yes{}", EOL));
        // only one terminator is stripped
        assert_eq!(stdin_line("yes\n\n"), format!("yes\n{}", EOL));
    }

    #[test]
    fn test_chunker_holds_split_char() {
        let mut c = Utf8Chunker::new();
        let bytes = "héllo".as_bytes();
        // split inside the two-byte 'é'
        assert_eq!(c.push(&bytes[..2]).as_deref(), Some("h"));
        assert_eq!(c.push(&bytes[2..]).as_deref(), Some("éllo"));
        assert_eq!(c.finish(), None);
    }

    #[test]
    fn test_chunker_holds_split_escape() {
        let mut c = Utf8Chunker::new();
        assert_eq!(c.push(b"ok \x1b[3"), Some("ok ".to_string()));
        let text = c.push(b"1mred\x1b[0m plain").unwrap();
        assert_eq!(text, "\x1b[31mred\x1b[0m plain");
        assert_eq!(clean_chunk(&text), "red plain");
        assert_eq!(c.finish(), None);
    }

    #[test]
    fn test_chunker_flushes_trailing_escape_at_end() {
        let mut c = Utf8Chunker::new();
        assert_eq!(c.push(b"done\x1b[0m"), Some("done".to_string()));
        let rest = c.finish().unwrap();
        assert_eq!(rest, "\x1b[0m");
        assert_eq!(strip_ansi(&rest), "");
    }

    #[test]
    fn test_chunker_holds_open_osc() {
        let mut c = Utf8Chunker::new();
        assert_eq!(c.push(b"see \x1b]8;;https://exa"), Some("see ".to_string()));
        let text = c.push(b"mple.com\x07link\x1b]8;;\x07\n").unwrap();
        assert_eq!(clean_chunk(&text), "link");
    }

    #[test]
    fn test_chunker_passes_escape_free_text() {
        let mut c = Utf8Chunker::new();
        // an ESC followed by text with spaces is not a sequence in progress
        assert_eq!(c.push(b"a \x1b b"), Some("a \x1b b".to_string()));
    }

    #[test]
    fn test_chunker_invalid_bytes_are_lossy() {
        let mut c = Utf8Chunker::new();
        let text = c.push(&[b'a', 0xFF, b'b']).unwrap();
        assert_eq!(text, "a\u{FFFD}b");
    }
}
