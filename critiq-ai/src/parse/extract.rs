//! Structural extraction of a JSON object from free text

use serde_json::{Map, Value};

/// Bytes of response text the fallback scan will look at
pub const FALLBACK_SCAN_LIMIT: usize = 64 * 1024;

/// Opening braces the fallback scan will try before giving up
const FALLBACK_MAX_CANDIDATES: usize = 8;

/// Result of phase one
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub object: Map<String, Value>,
    pub used_fallback: bool,
}

/// Strict parse, then one bounded best-effort scan
///
/// Strict: the trimmed text is exactly one JSON object. Fallback: within the
/// first [`FALLBACK_SCAN_LIMIT`] bytes, the first balanced `{...}` span that
/// parses as an object. Returns `None` when both fail.
pub fn extract_object(raw: &str) -> Option<Extracted> {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(Extracted {
            object,
            used_fallback: false,
        });
    }

    fallback_scan(raw).map(|object| Extracted {
        object,
        used_fallback: true,
    })
}

fn fallback_scan(raw: &str) -> Option<Map<String, Value>> {
    let mut limit = raw.len().min(FALLBACK_SCAN_LIMIT);
    while !raw.is_char_boundary(limit) {
        limit -= 1;
    }
    let window = &raw[..limit];

    let mut candidates = 0;
    for (start, ch) in window.char_indices() {
        if ch != '{' {
            continue;
        }
        candidates += 1;
        if candidates > FALLBACK_MAX_CANDIDATES {
            return None;
        }
        if let Some(end) = balanced_end(&window[start..]) {
            if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&window[start..start + end]) {
                return Some(object);
            }
        }
    }
    None
}

/// Byte length of the balanced object starting at `text[0] == '{'`
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_object() {
        let extracted = extract_object("  {\"label\": \"positive\"}\n").unwrap();
        assert!(!extracted.used_fallback);
        assert_eq!(extracted.object["label"], "positive");
    }

    #[test]
    fn test_fenced_object_uses_fallback() {
        let raw = "Here you go:\n```json\n{\"label\": \"negative\", \"note\": \"a } in text\"}\n```";
        let extracted = extract_object(raw).unwrap();
        assert!(extracted.used_fallback);
        assert_eq!(extracted.object["label"], "negative");
        assert_eq!(extracted.object["note"], "a } in text");
    }

    #[test]
    fn test_nested_object_kept_whole() {
        let raw = "prefix {\"a\": {\"b\": 1}} suffix";
        let extracted = extract_object(raw).unwrap();
        assert_eq!(extracted.object["a"]["b"], 1);
    }

    #[test]
    fn test_skips_unparseable_candidates() {
        let raw = "{not json} then {\"ok\": true}";
        let extracted = extract_object(raw).unwrap();
        assert_eq!(extracted.object["ok"], true);
    }

    #[test]
    fn test_arrays_and_garbage_fail() {
        assert!(extract_object("[1, 2, 3]").is_none());
        assert!(extract_object("no braces at all").is_none());
        assert!(extract_object("{\"unterminated\": ").is_none());
    }

    #[test]
    fn test_object_past_scan_limit_not_found() {
        let raw = format!("{}{{\"late\": 1}}", "x".repeat(FALLBACK_SCAN_LIMIT));
        assert!(extract_object(&raw).is_none());
    }
}
