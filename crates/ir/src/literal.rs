// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// the two pieces of the front-end contract the backend depends on:
//
// - decode_string_literal: the backend never re-parses source text,
//   string literals arrive with their original quoting and escape
//   syntax and are decoded here, once, at interning time
// - is_init_func: package initializers are invoked by the entry stub
//   in declaration order before 'main.main'

/// decode a source-language string literal into raw bytes.
///
/// a literal delimited by backquotes is raw: the bytes between the
/// quotes pass through unchanged. a double-quoted literal understands
/// the usual single-character escapes plus \xHH, \ooo (three octal
/// digits), \uHHHH and \UHHHHHHHH (encoded as UTF-8). undelimited
/// input is returned byte-for-byte, which keeps already-decoded
/// strings harmless.
pub fn decode_string_literal(raw: &str) -> Vec<u8> {
    let bytes = raw.as_bytes();

    if bytes.len() >= 2 && bytes[0] == b'`' && bytes[bytes.len() - 1] == b'`' {
        return bytes[1..bytes.len() - 1].to_vec();
    }

    let inner = if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        &bytes[1..bytes.len() - 1]
    } else {
        return bytes.to_vec();
    };

    let mut out: Vec<u8> = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let b = inner[i];
        if b != b'\\' || i + 1 == inner.len() {
            out.push(b);
            i += 1;
            continue;
        }

        let esc = inner[i + 1];
        i += 2;
        match esc {
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'x' => {
                let value = hex_digits(inner, &mut i, 2);
                out.push(value as u8);
            }
            b'0'..=b'7' => {
                // \ooo, the first digit is already consumed
                let mut value = (esc - b'0') as u32;
                for _ in 0..2 {
                    if i < inner.len() && inner[i].is_ascii_digit() && inner[i] < b'8' {
                        value = value * 8 + (inner[i] - b'0') as u32;
                        i += 1;
                    }
                }
                out.push(value as u8);
            }
            b'u' => {
                let value = hex_digits(inner, &mut i, 4);
                push_utf8(&mut out, value);
            }
            b'U' => {
                let value = hex_digits(inner, &mut i, 8);
                push_utf8(&mut out, value);
            }
            other => {
                // unknown escape, keep it verbatim
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    out
}

fn hex_digits(input: &[u8], pos: &mut usize, count: usize) -> u32 {
    let mut value: u32 = 0;
    for _ in 0..count {
        if *pos >= input.len() {
            break;
        }
        let digit = match input[*pos] {
            b @ b'0'..=b'9' => (b - b'0') as u32,
            b @ b'a'..=b'f' => (b - b'a') as u32 + 10,
            b @ b'A'..=b'F' => (b - b'A') as u32 + 10,
            _ => break,
        };
        value = value * 16 + digit;
        *pos += 1;
    }
    value
}

fn push_utf8(out: &mut Vec<u8>, code_point: u32) {
    match char::from_u32(code_point) {
        Some(c) => {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
        None => {
            // invalid scalar value, substitute U+FFFD like the source language does
            out.extend_from_slice("\u{fffd}".as_bytes());
        }
    }
}

/// whether the named function is a package initializer.
///
/// initializers are named "<pkg>.init", numbered ones "<pkg>.init$1",
/// "<pkg>.init$2" and so on.
pub fn is_init_func(name: &str) -> bool {
    let last = name.rsplit('.').next().unwrap_or(name);
    last == "init" || last.starts_with("init$")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::literal::{decode_string_literal, is_init_func};

    #[test]
    fn test_decode_plain() {
        assert_eq!(decode_string_literal("\"hello\""), b"hello".to_vec());
        assert_eq!(decode_string_literal("\"\""), b"".to_vec());
        assert_eq!(decode_string_literal("plain"), b"plain".to_vec());
    }

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode_string_literal("\"a\\nb\""), b"a\nb".to_vec());
        assert_eq!(decode_string_literal("\"\\t\\r\\\\\\\"\""), b"\t\r\\\"".to_vec());
        assert_eq!(decode_string_literal("\"\\x41\\x0a\""), b"A\n".to_vec());
        assert_eq!(decode_string_literal("\"\\101\""), b"A".to_vec());
        assert_eq!(decode_string_literal("\"\\u00e9\""), "é".as_bytes().to_vec());
        assert_eq!(
            decode_string_literal("\"\\U0001f600\""),
            "\u{1f600}".as_bytes().to_vec()
        );
    }

    #[test]
    fn test_decode_raw() {
        assert_eq!(decode_string_literal("`a\\nb`"), b"a\\nb".to_vec());
    }

    #[test]
    fn test_is_init_func() {
        assert!(is_init_func("os.init"));
        assert!(is_init_func("strings.init$1"));
        assert!(!is_init_func("main.main"));
        assert!(!is_init_func("pkg.initialize"));
    }
}
