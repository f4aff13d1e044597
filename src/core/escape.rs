//! Terminal escape filtering - raw terminal bytes to loggable text
//!
//! Strips CSI sequences (`ESC [` ... final byte 0x40-0x7E, or the C1
//! introducer 0x9B), two byte escapes (`ESC` 0x40-0x5F) and control codes
//! other than tab and newline. Carriage returns are dropped here; line
//! handling happens once complete lines are available.
//!
//! Scan state is reset for every chunk. A sequence split across two reads
//! leaks its tail into the second chunk as literal text.

const ESC: u8 = 0x1B;
const CSI_C1: u8 = 0x9B;
const BACKSPACE: u8 = 0x08;

/// Line feed, cursor forward 79, then the start of another CSI. Followed by
/// cursor up, this is how an 80 column terminal wraps a long line.
const WRAP_PREFIX: [u8; 8] = [b'\n', ESC, b'[', b'7', b'9', b'C', ESC, b'['];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Text,
    EscapeStart,
    Csi,
}

/// Stateless filter applied to each received chunk
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapeFilter;

impl EscapeFilter {
    pub fn new() -> Self {
        Self
    }

    /// Clean one chunk of raw terminal output
    pub fn filter(&self, raw: &[u8]) -> String {
        let mut out: Vec<u8> = Vec::with_capacity(raw.len());
        let mut state = Scan::Text;
        let mut last_final: Option<u8> = None;
        let mut unwrap_pending = false;

        for (index, &c) in raw.iter().enumerate() {
            if c == ESC {
                state = Scan::EscapeStart;
                continue;
            } else if c == CSI_C1 {
                state = Scan::Csi;
            }

            match state {
                Scan::EscapeStart => {
                    state = Scan::Text;
                    if c == b'[' {
                        state = Scan::Csi;
                        continue;
                    } else if (0x40..=0x5F).contains(&c) {
                        continue;
                    }
                }
                Scan::Csi => {
                    if (0x40..=0x7E).contains(&c) {
                        if last_final == Some(b'C')
                            && c == b'A'
                            && index >= WRAP_PREFIX.len()
                            && raw[index - WRAP_PREFIX.len()..index] == WRAP_PREFIX
                        {
                            unwrap_pending = true;
                        }
                        last_final = Some(c);
                        state = Scan::Text;
                    }
                    continue;
                }
                Scan::Text => {}
            }

            // \b\n is what a terminal sends instead of \r\n when the line
            // holds a single character; only a real rubout deletes.
            if c == BACKSPACE && !out.is_empty() {
                if let Some(&next) = raw.get(index + 1) {
                    if next != b'\n' {
                        pop_char(&mut out);
                    }
                }
            }

            if c < 0x20 && c != b'\t' && c != b'\n' {
                continue;
            }

            if unwrap_pending {
                // Drop the injected line feed and the character the
                // terminal repeats at the wrap column.
                pop_char(&mut out);
                unwrap_pending = false;
                continue;
            }

            out.push(c);
        }

        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Remove the last UTF-8 character from a byte buffer
fn pop_char(out: &mut Vec<u8>) {
    while let Some(byte) = out.pop() {
        if byte & 0xC0 != 0x80 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(raw: &[u8]) -> String {
        EscapeFilter::new().filter(raw)
    }

    #[test]
    fn test_strip_colour_codes() {
        assert_eq!(clean(b"\x1b[01;34mdirectory\x1b[0m"), "directory");
        assert_eq!(clean(b"plain \x1b[1mbold\x1b[22m text"), "plain bold text");
    }

    #[test]
    fn test_two_byte_escape_and_c1_introducer() {
        assert_eq!(clean(b"a\x1bDb\x1bMc"), "abc");
        // Not a two byte escape: the byte after ESC survives
        assert_eq!(clean(b"a\x1b7b"), "a7b");
        assert_eq!(clean(b"x\x9b2Ky"), "xy");
    }

    #[test]
    fn test_backspace_deletes() {
        assert_eq!(clean(b"ab\x08c"), "ac");
    }

    #[test]
    fn test_backspace_before_newline_keeps_character() {
        assert_eq!(clean(b"a\x08\n"), "a\n");
    }

    #[test]
    fn test_trailing_backspace_keeps_character() {
        assert_eq!(clean(b"ab\x08"), "ab");
    }

    #[test]
    fn test_backspace_removes_whole_utf8_character() {
        assert_eq!(clean("aé\x08b".as_bytes()), "ab");
    }

    #[test]
    fn test_control_codes_dropped_tab_newline_kept() {
        assert_eq!(clean(b"one\r\ntwo\tthree\x07\n"), "one\ntwo\tthree\n");
    }

    #[test]
    fn test_unwrap_80_column_line() {
        // The terminal wraps, moves to column 80 of the previous row and
        // repeats the character sitting there.
        let raw = b"linux-linaro-trackin\n\x1b[79C\x1b[Agg";
        assert_eq!(clean(raw), "linux-linaro-tracking");
    }

    #[test]
    fn test_cursor_up_without_wrap_prefix_is_just_stripped() {
        assert_eq!(clean(b"ab\x1b[5C\x1b[Acd"), "abcd");
    }

    #[test]
    fn test_sequence_split_across_chunks_leaks() {
        let filter = EscapeFilter::new();
        assert_eq!(filter.filter(b"red\x1b[3"), "red");
        assert_eq!(filter.filter(b"1mtext"), "1mtext");
    }
}
