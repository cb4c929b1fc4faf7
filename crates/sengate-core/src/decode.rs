//! Legacy text decoding.
//!
//! Older firmware writes multi-byte text fields as runs of literal
//! `\xHH` escapes, one escape per raw byte, with the byte sequence
//! encoded as Big5. `decode_legacy_text` reverses that: it rebuilds the
//! byte sequence and reinterprets it as Big5. Strings without the
//! escape pattern pass through untouched, which makes the decode
//! idempotent. Any malformed escape or undecodable byte run keeps the
//! original text; a decode problem must never fail the pipeline.

use encoding_rs::BIG5;
use tracing::warn;

/// Whether the string contains at least one `\xHH` escape.
fn has_escapes(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.windows(4).any(|w| {
        w[0] == b'\\' && w[1] == b'x' && w[2].is_ascii_hexdigit() && w[3].is_ascii_hexdigit()
    })
}

/// Rebuild the raw byte sequence from escaped text.
///
/// Escapes become their byte value; plain ASCII characters become their
/// own byte. Returns `None` on a malformed escape or any non-ASCII
/// character, both of which mean the text is not in the legacy shape.
fn unescape_bytes(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if i + 3 < bytes.len()
                && bytes[i + 1] == b'x'
                && bytes[i + 2].is_ascii_hexdigit()
                && bytes[i + 3].is_ascii_hexdigit()
            {
                let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok()?;
                let byte = u8::from_str_radix(hex, 16).ok()?;
                out.push(byte);
                i += 4;
            } else {
                return None;
            }
        } else if bytes[i].is_ascii() {
            out.push(bytes[i]);
            i += 1;
        } else {
            return None;
        }
    }
    Some(out)
}

/// Decode a legacy-escaped text field.
///
/// Already-decoded input (no escape pattern) is returned unchanged.
pub fn decode_legacy_text(s: &str) -> String {
    if !has_escapes(s) {
        return s.to_string();
    }

    let Some(raw) = unescape_bytes(s) else {
        warn!(text = %s, "malformed legacy escape sequence, keeping original text");
        return s.to_string();
    };

    let (decoded, _, had_errors) = BIG5.decode(&raw);
    if had_errors {
        warn!(text = %s, "legacy byte run is not valid Big5, keeping original text");
        return s.to_string();
    }

    decoded.into_owned()
}
