//! Locates the first balanced JSON object inside free-form model output.
//!
//! The scanner tracks brace depth outside of string literals and honours
//! backslash escapes inside them, so prose, code fences or braces embedded in
//! strings do not confuse it. The same scan decides whether a response was
//! cut off mid-object.

/// Result of scanning model output for a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectScan<'a> {
    /// First balanced `{...}` slice, braces included.
    Complete(&'a str),
    /// An object was opened but never closed.
    Unterminated,
    /// No `{` appears in the text.
    Absent,
}

/// Scans `text` for its first balanced JSON object.
pub fn scan_first_object(text: &str) -> ObjectScan<'_> {
    let Some(start) = text.find('{') else {
        return ObjectScan::Absent;
    };
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return ObjectScan::Complete(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    ObjectScan::Unterminated
}

/// Whether the output looks cut off: blank, or an object that never closes.
pub fn looks_truncated(text: &str) -> bool {
    text.trim().is_empty() || scan_first_object(text) == ObjectScan::Unterminated
}
