use regex_lite::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Extract a JSON object from arbitrary model output.
///
/// Model text arrives with prose around the object, double-encoded escape
/// sequences, or truncated mid-object when a stream was cut off. This
/// recovers the object when possible and returns `None` otherwise; it is
/// stateless and safe to re-invoke on a growing prefix of the same text.
pub fn recover_object(text: &str) -> Option<Map<String, Value>> {
    let candidate = extract_candidate(text)?;

    // Undo one level of self-encoding (models that return their JSON as an
    // escaped string literal).
    let cleaned = candidate.replace("\\n", "\n").replace("\\\"", "\"");

    if let Some(object) = parse_object(&cleaned) {
        return Some(object);
    }

    // An empty object out of repair means nothing real was salvaged.
    let repaired = repair(&cleaned)?;
    parse_object(&repaired).filter(|map| !map.is_empty())
}

/// Outermost balanced-brace substring, tolerating one nesting level. A
/// stream truncated mid-object has no balanced match, so fall back to
/// everything from the first `{` and let repair close it.
fn extract_candidate(text: &str) -> Option<&str> {
    if let Some(found) = object_pattern().find(text) {
        return Some(found.as_str());
    }
    text.find('{').map(|start| &text[start..])
}

fn object_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{(?:[^{}]|\{[^{}]*\})*\}").expect("object pattern"))
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    Key,
    Colon,
    CommaOrEnd,
}

/// Rewrite malformed-but-salvageable JSON into valid JSON.
///
/// Scans with a string/nesting state machine, re-emitting tokens into a
/// fresh buffer: commas are held back until the next member actually starts
/// (dropping trailing commas), raw control characters inside strings are
/// re-escaped, unterminated strings are closed, incomplete literals and
/// numbers at end-of-input are completed or trimmed, and any dangling
/// key/colon is cut back to the last syntactically complete position before
/// the open containers are closed.
fn repair(input: &str) -> Option<String> {
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    // Last position at which truncating `out` (and the matching stack
    // depth) yields a closable document.
    let mut good_len = 0usize;
    let mut good_depth = 0usize;
    let mut expect = Expect::Value;
    let mut pending_comma = false;
    let mut chars = input.chars().peekable();

    'scan: while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        match c {
            '"' => {
                let is_key = expect == Expect::Key;
                if pending_comma {
                    out.push(',');
                    pending_comma = false;
                }
                out.push('"');
                let mut terminated = false;
                let mut escaped = false;
                for sc in chars.by_ref() {
                    if escaped {
                        out.push(sc);
                        escaped = false;
                        continue;
                    }
                    match sc {
                        '\\' => {
                            out.push(sc);
                            escaped = true;
                        }
                        '"' => {
                            out.push('"');
                            terminated = true;
                            break;
                        }
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        other => out.push(other),
                    }
                }
                if !terminated {
                    // Input ended inside this string. A value-string is
                    // closable; a half-written key is dropped.
                    if is_key {
                        out.truncate(good_len);
                        stack.truncate(good_depth);
                    } else {
                        if escaped {
                            // A dangling backslash would escape the closing
                            // quote we are about to add.
                            out.pop();
                        }
                        out.push('"');
                    }
                    expect = Expect::CommaOrEnd;
                    break 'scan;
                }
                if is_key {
                    expect = Expect::Colon;
                } else {
                    good_len = out.len();
                    good_depth = stack.len();
                    expect = Expect::CommaOrEnd;
                }
            }
            '{' => {
                if pending_comma {
                    out.push(',');
                    pending_comma = false;
                }
                out.push('{');
                stack.push('}');
                good_len = out.len();
                good_depth = stack.len();
                expect = Expect::Key;
            }
            '[' => {
                if pending_comma {
                    out.push(',');
                    pending_comma = false;
                }
                out.push('[');
                stack.push(']');
                good_len = out.len();
                good_depth = stack.len();
                expect = Expect::Value;
            }
            '}' | ']' => {
                pending_comma = false;
                if stack.last() != Some(&c) {
                    break 'scan;
                }
                stack.pop();
                out.push(c);
                good_len = out.len();
                good_depth = stack.len();
                expect = Expect::CommaOrEnd;
                if stack.is_empty() {
                    // Complete document; anything after it is prose.
                    break 'scan;
                }
            }
            ':' => {
                out.push(':');
                expect = Expect::Value;
            }
            ',' => {
                pending_comma = true;
                expect = if stack.last() == Some(&'}') {
                    Expect::Key
                } else {
                    Expect::Value
                };
            }
            _ => {
                let mut token = String::new();
                token.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, ',' | '}' | ']' | ':') {
                        break;
                    }
                    token.push(next);
                    chars.next();
                }
                let at_end = chars.peek().is_none();
                match complete_scalar(&token, at_end) {
                    Some(scalar) => {
                        if pending_comma {
                            out.push(',');
                            pending_comma = false;
                        }
                        out.push_str(&scalar);
                        good_len = out.len();
                        good_depth = stack.len();
                        expect = Expect::CommaOrEnd;
                    }
                    None => {
                        out.truncate(good_len);
                        stack.truncate(good_depth);
                        expect = Expect::CommaOrEnd;
                        break 'scan;
                    }
                }
            }
        }
    }

    // A dangling key or colon at end-of-input is cut back to the last
    // complete position before closing.
    if matches!(expect, Expect::Value | Expect::Colon) {
        out.truncate(good_len);
        stack.truncate(good_depth);
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Finish a scalar token: complete literals (`tru` -> `true`) and trim
/// numbers cut off mid-exponent when the input ends inside the token.
fn complete_scalar(token: &str, at_end: bool) -> Option<String> {
    for literal in ["true", "false", "null"] {
        if token == literal || (at_end && literal.starts_with(token)) {
            return Some(literal.to_string());
        }
    }

    let mut number = token;
    if at_end {
        number = number.trim_end_matches(|c: char| matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    }
    if !number.is_empty() && serde_json::from_str::<serde_json::Number>(number).is_ok() {
        return Some(number.to_string());
    }
    None
}
