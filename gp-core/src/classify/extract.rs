//! JSON extraction from noisy tool output
//!
//! `dcgmi` can print log lines before or after its JSON document. The whole
//! text is tried first, then each balanced `{...}` block in order.

use serde_json::Value;

pub fn extract_json(text: &str) -> Option<Value> {
    let text = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..start + end]) {
                return Some(value);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the object starting at `s[0] == '{'`, string-aware
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
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
    fn test_plain_document() {
        let value = extract_json("  {\"a\": 1}\n").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_document_wrapped_in_log_lines() {
        let text = "Successfully ran diagnostic for group.\n{\"x\": {\"msg\": \"brace } inside\"}}\nDone {";
        let value = extract_json(text).unwrap();
        assert_eq!(value["x"]["msg"], "brace } inside");
    }

    #[test]
    fn test_skips_unparseable_block() {
        let text = "warn {not json} then {\"ok\": true}";
        assert_eq!(extract_json(text).unwrap()["ok"], true);
    }

    #[test]
    fn test_no_document() {
        assert!(extract_json("Error: unable to connect to host engine").is_none());
        assert!(extract_json("").is_none());
    }
}
