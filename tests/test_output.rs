//! Unit tests for ANSI stripping and input-encoding decoders.

use mcp_shell::output::{append_inline, decode_control_codes, decode_hex, strip_ansi};

// ---------------------------------------------------------------------------
// ANSI stripping
// ---------------------------------------------------------------------------

#[test]
fn test_strip_ansi_removes_color_codes() {
    let colored = "\x1b[31mred text\x1b[0m plain";
    assert_eq!(strip_ansi(colored), "red text plain");
}

#[test]
fn test_strip_ansi_removes_osc_title() {
    let with_title = "\x1b]0;my title\x07visible";
    assert_eq!(strip_ansi(with_title), "visible");
}

#[test]
fn test_strip_ansi_plain_text_unchanged() {
    assert_eq!(strip_ansi("just text"), "just text");
}

#[test]
fn test_strip_ansi_cursor_movement() {
    let moving = "\x1b[2Jcleared\x1b[1;1H";
    assert_eq!(strip_ansi(moving), "cleared");
}

// ---------------------------------------------------------------------------
// Control-code escape grammar
// ---------------------------------------------------------------------------

#[test]
fn test_decode_ctrl_c() {
    assert_eq!(decode_control_codes("^C").unwrap(), vec![0x03]);
}

#[test]
fn test_decode_ctrl_lowercase() {
    assert_eq!(decode_control_codes("^c").unwrap(), vec![0x03]);
}

#[test]
fn test_decode_ctrl_del() {
    assert_eq!(decode_control_codes("^?").unwrap(), vec![0x7f]);
}

#[test]
fn test_decode_literal_caret() {
    assert_eq!(decode_control_codes("^^").unwrap(), vec![b'^']);
}

#[test]
fn test_decode_simple_escapes() {
    assert_eq!(
        decode_control_codes("\\n\\r\\t\\b\\f\\v").unwrap(),
        vec![b'\n', b'\r', b'\t', 0x08, 0x0c, 0x0b]
    );
}

#[test]
fn test_decode_nul() {
    assert_eq!(decode_control_codes("\\0").unwrap(), vec![0x00]);
}

#[test]
fn test_decode_octal() {
    // \033 is ESC.
    assert_eq!(decode_control_codes("\\033").unwrap(), vec![0x1b]);
}

#[test]
fn test_decode_hex_escape() {
    assert_eq!(decode_control_codes("\\x1b").unwrap(), vec![0x1b]);
    assert_eq!(decode_control_codes("\\x03").unwrap(), vec![0x03]);
}

#[test]
fn test_decode_unicode_escape() {
    assert_eq!(decode_control_codes("\\u0041").unwrap(), vec![b'A']);
    // Multi-byte UTF-8.
    assert_eq!(
        decode_control_codes("\\u00e9").unwrap(),
        "é".as_bytes().to_vec()
    );
}

#[test]
fn test_decode_mixed_text_and_escapes() {
    assert_eq!(
        decode_control_codes("ls\\n").unwrap(),
        vec![b'l', b's', b'\n']
    );
}

#[test]
fn test_decode_invalid_hex_is_error() {
    assert!(decode_control_codes("\\xZZ").is_err());
}

#[test]
fn test_decode_dangling_escape_is_error() {
    assert!(decode_control_codes("text\\").is_err());
    assert!(decode_control_codes("text^").is_err());
}

#[test]
fn test_decode_invalid_control_is_error() {
    assert!(decode_control_codes("^!").is_err());
}

// ---------------------------------------------------------------------------
// Hex decoding
// ---------------------------------------------------------------------------

#[test]
fn test_decode_hex_basic() {
    assert_eq!(decode_hex("6c730a").unwrap(), vec![b'l', b's', b'\n']);
}

#[test]
fn test_decode_hex_with_whitespace() {
    assert_eq!(decode_hex("6c 73 0a").unwrap(), vec![b'l', b's', b'\n']);
}

#[test]
fn test_decode_hex_odd_length_is_error() {
    assert!(decode_hex("abc").is_err());
}

#[test]
fn test_decode_hex_invalid_digit_is_error() {
    assert!(decode_hex("zz").is_err());
}

// ---------------------------------------------------------------------------
// Inline prefix buffering
// ---------------------------------------------------------------------------

#[test]
fn test_append_inline_under_cap() {
    let mut buf = Vec::new();
    assert!(!append_inline(&mut buf, b"hello", 100));
    assert_eq!(buf, b"hello");
}

#[test]
fn test_append_inline_truncates_at_cap() {
    let mut buf = Vec::new();
    assert!(append_inline(&mut buf, b"hello world", 5));
    assert_eq!(buf, b"hello");
}

#[test]
fn test_append_inline_full_buffer_rejects_more() {
    let mut buf = b"12345".to_vec();
    assert!(append_inline(&mut buf, b"more", 5));
    assert_eq!(buf, b"12345");
}
