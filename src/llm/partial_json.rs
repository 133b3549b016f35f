//! Best-effort parsing of an incomplete JSON document.
//!
//! While a structured answer streams in, [`parse_partial`] turns the prefix
//! received so far into the largest valid value it can: an unterminated
//! string value is closed, a dangling key, comma, or half-written number is
//! dropped, and every open object and array is closed.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Expect {
    Key,
    Colon,
    Value,
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Frame {
    Object(Expect),
    Array,
}

fn closers(stack: &[Frame]) -> String {
    stack
        .iter()
        .rev()
        .map(|f| match f {
            Frame::Object(_) => '}',
            Frame::Array => ']',
        })
        .collect()
}

fn value_done(stack: &mut [Frame]) {
    if let Some(Frame::Object(expect)) = stack.last_mut() {
        *expect = Expect::Next;
    }
}

/// Parse the longest closable prefix of `text`.
///
/// Text before the first `{` or `[` (for example a code fence) is skipped.
/// Returns `None` when nothing parsable has arrived yet.
pub fn parse_partial(text: &str) -> Option<Value> {
    let start = text.find(['{', '['])?;
    let src = &text[start..];

    let mut stack: Vec<Frame> = Vec::new();
    // Byte offset into `src` plus the closers that make `src[..offset]` valid.
    let mut cut: Option<(usize, String)> = None;
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escape = false;
    let mut in_scalar = false;

    for (i, c) in src.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
                if string_is_key {
                    if let Some(Frame::Object(expect)) = stack.last_mut() {
                        *expect = Expect::Colon;
                    }
                } else {
                    value_done(&mut stack);
                    cut = Some((i + 1, closers(&stack)));
                }
            }
            continue;
        }

        if in_scalar {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.') {
                continue;
            }
            in_scalar = false;
            value_done(&mut stack);
            cut = Some((i, closers(&stack)));
        }

        match c {
            '{' => {
                stack.push(Frame::Object(Expect::Key));
                cut = Some((i + 1, closers(&stack)));
            }
            '[' => {
                stack.push(Frame::Array);
                cut = Some((i + 1, closers(&stack)));
            }
            '}' | ']' => {
                stack.pop();
                value_done(&mut stack);
                cut = Some((i + 1, closers(&stack)));
                if stack.is_empty() {
                    break;
                }
            }
            '"' => {
                in_string = true;
                string_is_key = matches!(stack.last(), Some(Frame::Object(Expect::Key)));
            }
            ':' => {
                if let Some(Frame::Object(expect)) = stack.last_mut() {
                    *expect = Expect::Value;
                }
            }
            ',' => {
                if let Some(Frame::Object(expect)) = stack.last_mut() {
                    *expect = Expect::Key;
                }
            }
            c if c.is_whitespace() => {}
            _ => in_scalar = true,
        }
    }

    // An unterminated string value is shown as far as it has arrived.
    if in_string && !string_is_key {
        let body = if escape { &src[..src.len() - 1] } else { src };
        let candidate = format!("{}\"{}", body, closers(&stack));
        // Fails on a half-written \u escape; fall back to the last cut.
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Some(value);
        }
    }

    let (offset, closing) = cut?;
    serde_json::from_str(&format!("{}{}", &src[..offset], closing)).ok()
}
