//! Logging helpers for radio-supplied strings and node addresses.
//!
//! Node names arrive over the air and may contain control characters or be
//! arbitrarily long; they are escaped so every log record stays on one line.

const MAX_PREVIEW: usize = 120;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Other control characters become `\xNN`. Strings longer than the preview
///   limit are cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Format a numeric node id the way Meshtastic clients display it (`!1234abcd`).
pub fn node_label(id: u32) -> String {
    format!("!{:08x}", id)
}

/// Hex preview of the first `max` bytes of a buffer.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    data.iter()
        .take(max)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_control_chars() {
        let s = "Node\nName\r\t\u{7}";
        assert_eq!(escape_log(s), "Node\\nName\\r\\t\\x07");
    }

    #[test]
    fn truncates_long_names() {
        let long = "x".repeat(500);
        let esc = escape_log(&long);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
    }

    #[test]
    fn node_label_is_zero_padded() {
        assert_eq!(node_label(0x1234abcd), "!1234abcd");
        assert_eq!(node_label(0xab), "!000000ab");
    }

    #[test]
    fn hex_snippet_limits_length() {
        assert_eq!(hex_snippet(&[0x94, 0xc3, 0x00, 0x10], 2), "94c3");
    }
}
