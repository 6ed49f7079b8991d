//! Best-effort repair of the almost-JSON that models tend to produce.
//!
//! Handles Markdown code fences, prose around the object, single-quoted strings, unquoted
//! keys, Python literals, trailing commas and truncated output. The result is not guaranteed
//! to parse; callers still go through `serde_json`.

/// Returns the input rewritten into (hopefully) valid JSON.
pub fn repair_json(input: &str) -> String {
    let body = outer_value(strip_code_fence(input.trim()));
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::with_capacity(body.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                i = copy_string(&chars, i, &mut out);
                continue;
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                trim_trailing_comma(&mut out);
                if closers.last() == Some(&c) {
                    closers.pop();
                    out.push(c);
                }
            }
            '-' | '0'..='9' => {
                let start = i;
                while i < chars.len() && is_number_char(chars[i]) {
                    i += 1;
                }
                out.extend(&chars[start..i]);
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let is_key = chars[i..]
                    .iter()
                    .find(|c| !c.is_whitespace())
                    .is_some_and(|c| *c == ':');
                if is_key {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    push_bare_word(&word, &mut out);
                }
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }
    trim_trailing_comma(&mut out);
    while let Some(closer) = closers.pop() {
        out.push(closer);
    }
    out
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')
}

fn push_bare_word(word: &str, out: &mut String) {
    match word {
        "true" | "True" => out.push_str("true"),
        "false" | "False" => out.push_str("false"),
        "null" | "None" | "undefined" => out.push_str("null"),
        other => {
            out.push('"');
            out.push_str(other);
            out.push('"');
        }
    }
}

/// Copies the string starting at `chars[start]` as a double-quoted JSON string and
/// returns the index just past it. Unterminated strings are closed.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if i + 1 < chars.len() => {
                let next = chars[i + 1];
                if next == '\'' {
                    out.push('\'');
                } else {
                    out.push('\\');
                    out.push(next);
                }
                i += 2;
                continue;
            }
            c if c == quote => {
                out.push('"');
                return i + 1;
            }
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
        i += 1;
    }
    out.push('"');
    i
}

fn trim_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end().len();
    if out[..trimmed].ends_with(',') {
        out.truncate(trimmed - 1);
    }
}

fn strip_code_fence(input: &str) -> &str {
    let Some(open) = input.find("```") else {
        return input;
    };
    let after_open = &input[open + 3..];
    // Skip the language tag on the fence line.
    let body_start = after_open.find('\n').map_or(0, |n| n + 1);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Slices from the first `{` or `[` to its last matching closer, dropping surrounding prose.
fn outer_value(input: &str) -> &str {
    let Some(start) = input.find(['{', '[']) else {
        return input;
    };
    let closer = if input[start..].starts_with('{') {
        '}'
    } else {
        ']'
    };
    match input.rfind(closer) {
        Some(end) if end > start => &input[start..=end],
        _ => &input[start..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn repaired(input: &str) -> Value {
        serde_json::from_str(&repair_json(input)).unwrap()
    }

    #[test]
    fn test_unquoted_keys_and_single_quotes() {
        assert_eq!(
            repaired("{score: 1.5, reason: 'good'}"),
            json!({"score": 1.5, "reason": "good"})
        );
    }

    #[test]
    fn test_fenced_and_wrapped_in_prose() {
        assert_eq!(
            repaired("Here you go:\n```json\n{\"score\": 0.9, \"reason\": \"ok\"}\n```\nThanks"),
            json!({"score": 0.9, "reason": "ok"})
        );
        assert_eq!(
            repaired("The verdict is {\"score\": 1, \"reason\": \"fine\"} as requested."),
            json!({"score": 1, "reason": "fine"})
        );
    }

    #[test]
    fn test_trailing_comma_literals_and_truncation() {
        assert_eq!(
            repaired("{'pass': True, 'notes': None, 'tags': ['a', 'b',],}"),
            json!({"pass": true, "notes": null, "tags": ["a", "b"]})
        );
        assert_eq!(
            repaired("{\"score\": 2.5e1, \"reason\": \"cut off"),
            json!({"score": 25.0, "reason": "cut off"})
        );
    }

    #[test]
    fn test_quotes_inside_single_quoted_string() {
        assert_eq!(
            repaired(r#"{reason: 'said "hi"', score: 0}"#),
            json!({"reason": "said \"hi\"", "score": 0})
        );
    }

    #[test]
    fn test_valid_json_is_untouched() {
        let input = r#"{"a": [1, 2, {"b": "c, d"}]}"#;
        assert_eq!(repair_json(input), input);
    }
}
