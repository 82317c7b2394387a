//! Textual repairs for almost-JSON judge output.
//!
//! Each repair returns `None` when it has nothing to change, so callers can
//! tell a no-op from a repair that still did not help.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));

/// One repair strategy, applied in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Repair {
    /// Drop commas directly before `}` or `]`
    TrailingCommas,
    /// Close a dangling string literal
    CloseQuote,
    /// Append the closers missing at end of input
    CloseBraces,
    /// Keep only the first brace-balanced object
    BalancedPrefix,
}

impl Repair {
    /// All repairs, in the order they are tried.
    pub const ORDER: [Repair; 4] = [
        Repair::TrailingCommas,
        Repair::CloseQuote,
        Repair::CloseBraces,
        Repair::BalancedPrefix,
    ];

    /// Apply this repair to `text`. `None` if it would change nothing.
    pub fn apply(self, text: &str) -> Option<String> {
        match self {
            Repair::TrailingCommas => {
                let fixed = TRAILING_COMMA.replace_all(text, "$1");
                (fixed != text).then(|| fixed.into_owned())
            }
            Repair::CloseQuote => {
                (unescaped_quotes(text) % 2 == 1).then(|| format!("{text}\""))
            }
            Repair::CloseBraces => {
                let closers = missing_closers(text);
                (!closers.is_empty()).then(|| format!("{text}{closers}"))
            }
            Repair::BalancedPrefix => {
                let start = text.find('{')?;
                let end = find_matching_brace(&text[start..])?;
                let prefix = &text[start..start + end];
                (prefix != text).then(|| prefix.to_string())
            }
        }
    }
}

impl std::fmt::Display for Repair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Repair::TrailingCommas => "trailing_commas",
            Repair::CloseQuote => "close_quote",
            Repair::CloseBraces => "close_braces",
            Repair::BalancedPrefix => "balanced_prefix",
        };
        f.write_str(name)
    }
}

fn unescaped_quotes(s: &str) -> usize {
    let mut count = 0;
    let mut escape = false;
    for c in s.chars() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' => escape = true,
            '"' => count += 1,
            _ => {}
        }
    }
    count
}

/// Closers for every `{` / `[` still open at end of `s`, innermost first.
fn missing_closers(s: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for c in s.chars() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    stack.into_iter().rev().collect()
}

/// Byte length of the brace-balanced object at the start of `s`.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
