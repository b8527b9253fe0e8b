//! Python literal encoding for command buffers.
//!
//! Whatever the payload, the produced literal only contains printable ASCII,
//! so no byte of it can be mistaken for a control character or a framing
//! marker by the interpreter.

use std::fmt::Write;

/// Encode raw bytes as a Python bytes literal, e.g. `b'ab\x00\\'`.
pub fn bytes_literal(bytes: &[u8]) -> String {
    let mut lit = String::with_capacity(bytes.len() + 3);
    lit.push_str("b'");
    for &b in bytes {
        match b {
            b'\\' => lit.push_str("\\\\"),
            b'\'' => lit.push_str("\\'"),
            0x20..=0x7e => lit.push(b as char),
            _ => {
                let _ = write!(lit, "\\x{:02x}", b);
            }
        }
    }
    lit.push('\'');
    lit
}

/// Encode text as a Python string literal, e.g. `'/alarm/caf\xe9.py'`.
pub fn str_literal(text: &str) -> String {
    let mut lit = String::with_capacity(text.len() + 2);
    lit.push('\'');
    for c in text.chars() {
        match c {
            '\\' => lit.push_str("\\\\"),
            '\'' => lit.push_str("\\'"),
            ' '..='~' => lit.push(c),
            c if (c as u32) < 0x100 => {
                let _ = write!(lit, "\\x{:02x}", c as u32);
            }
            c if (c as u32) < 0x10000 => {
                let _ = write!(lit, "\\u{:04x}", c as u32);
            }
            c => {
                let _ = write!(lit, "\\U{:08x}", c as u32);
            }
        }
    }
    lit.push('\'');
    lit
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn printable_bytes_are_verbatim() {
    assert_eq!(bytes_literal(b"import os"), "b'import os'");
}

#[test]
fn quotes_and_backslashes_are_escaped() {
    assert_eq!(bytes_literal(b"it's a \\"), r"b'it\'s a \\'");
    assert_eq!(str_literal("it's"), r"'it\'s'");
}

#[test]
fn markers_never_survive_encoding() {
    let all: Vec<u8> = (0..=255u8).collect();
    let lit = bytes_literal(&all);
    assert!(lit.bytes().all(|b| (0x20..=0x7e).contains(&b)));
    assert!(lit.contains("\\x04"));
    assert!(lit.contains("\\x00"));
    assert!(lit.contains("\\xff"));
}

#[test]
fn non_ascii_text() {
    assert_eq!(str_literal("café"), r"'caf\xe9'");
    assert_eq!(str_literal("温度"), r"'\u6e29\u5ea6'");
    assert_eq!(str_literal("⏰🔔"), r"'\u23f0\U0001f514'");
    assert_eq!(str_literal("a\nb"), r"'a\x0ab'");
}
