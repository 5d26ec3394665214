//! Text utilities for terminal output and input encoding.
//!
//! PTY scrollback keeps raw bytes with ANSI intact; [`strip_ansi`] is applied
//! on read when the caller asks for plain text. Input headed the other way
//! can be encoded as a control-code escape grammar or as raw hex -- the
//! decoders here turn those into the exact bytes written to the PTY master.

use regex::Regex;
use std::sync::LazyLock;

/// Regex matching ANSI escape sequences (CSI sequences, OSC sequences, etc.).
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    // Matches:
    // - CSI sequences: \x1b[ ... final_byte  (parameters can include 0-9;?<=>!)
    // - OSC sequences: \x1b] ... ST          (e.g., terminal title)
    // - Charset escapes: \x1b( / \x1b) plus designator
    // - Simple escapes: \x1b followed by a single character
    // - Backspace overstrike: char \x08
    Regex::new(
        r"\x1b\[[0-9;?<=>!]*[a-zA-Z~]|\x1b\][^\x07]*\x07|\x1b[()][0-9A-B]|\x1b[a-zA-Z]|.\x08",
    )
    .expect("invalid ANSI regex")
});

/// Strip ANSI escape codes from a string.
///
/// Terminal formatting (colors, cursor movement, titles) is meaningless to an
/// LLM caller; this removes it, leaving only the visible text.
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}

/// Decode the control-code escape grammar into bytes.
///
/// Supported forms:
/// - `^X` -- Ctrl-X as byte `X - 0x40` (`^C` = 0x03, `^?` = DEL)
/// - `\n \r \t \b \f \v \0` -- the usual single-character escapes
/// - `\xHH` -- two hex digits
/// - `\0oo` -- up to three octal digits after the backslash
/// - `\uHHHH` -- four hex digits, emitted as UTF-8
/// - `\\` and `^^` -- literal backslash / caret
///
/// Malformed sequences are an error; a partial write of a garbled interrupt
/// is worse than a rejection.
pub fn decode_control_codes(input: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '^' => match chars.next() {
                Some('^') => out.push(b'^'),
                Some('?') => out.push(0x7f),
                Some(ctrl) => {
                    let upper = ctrl.to_ascii_uppercase();
                    if ('@'..='_').contains(&upper) {
                        out.push(upper as u8 - 0x40);
                    } else {
                        return Err(format!("invalid control sequence '^{ctrl}'"));
                    }
                }
                None => return Err("dangling '^' at end of input".to_string()),
            },
            '\\' => match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('r') => out.push(b'\r'),
                Some('t') => out.push(b'\t'),
                Some('b') => out.push(0x08),
                Some('f') => out.push(0x0c),
                Some('v') => out.push(0x0b),
                Some('\\') => out.push(b'\\'),
                Some('0') => {
                    // \0 alone is NUL; \0oo consumes up to two more octal digits.
                    let mut value: u32 = 0;
                    let mut digits = 0;
                    while digits < 2 {
                        match chars.peek() {
                            Some(d) if ('0'..='7').contains(d) => {
                                value = value * 8 + (*d as u32 - '0' as u32);
                                chars.next();
                                digits += 1;
                            }
                            _ => break,
                        }
                    }
                    out.push(value as u8);
                }
                Some('x') => {
                    let hex: String = (0..2).filter_map(|_| chars.next()).collect();
                    let byte = u8::from_str_radix(&hex, 16)
                        .map_err(|_| format!("invalid hex escape '\\x{hex}'"))?;
                    out.push(byte);
                }
                Some('u') => {
                    let hex: String = (0..4).filter_map(|_| chars.next()).collect();
                    let code = u32::from_str_radix(&hex, 16)
                        .map_err(|_| format!("invalid unicode escape '\\u{hex}'"))?;
                    let ch = char::from_u32(code)
                        .ok_or_else(|| format!("invalid unicode scalar '\\u{hex}'"))?;
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
                Some(other) => return Err(format!("unknown escape '\\{other}'")),
                None => return Err("dangling '\\' at end of input".to_string()),
            },
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }

    Ok(out)
}

/// Decode a hex string (optionally whitespace-separated) into raw bytes.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err("hex input must have an even number of digits".to_string());
    }
    let mut out = Vec::with_capacity(compact.len() / 2);
    for pair in compact.as_bytes().chunks(2) {
        let s = std::str::from_utf8(pair).map_err(|_| "non-ASCII hex input".to_string())?;
        let byte = u8::from_str_radix(s, 16).map_err(|_| format!("invalid hex byte '{s}'"))?;
        out.push(byte);
    }
    Ok(out)
}

/// Copy bytes into an inline buffer up to `cap`, reporting truncation.
///
/// Returns true if the incoming chunk did not fit entirely.
pub fn append_inline(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let remaining = cap.saturating_sub(buffer.len());
    if chunk.len() <= remaining {
        buffer.extend_from_slice(chunk);
        false
    } else {
        buffer.extend_from_slice(&chunk[..remaining]);
        true
    }
}
