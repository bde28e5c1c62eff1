//! Turns raw model text into a validated [`Action`].
//!
//! Strategies run in a fixed order and the first JSON object that names a
//! tool wins:
//!   1. strict parse of the objects in a fenced code block,
//!   2. strict parse of each balanced `{...}` span in the whole text,
//!   3. the same two after textual repairs (smart quotes, trailing commas,
//!      stray newlines),
//!   4. pattern extraction of `tool` plus the key/value pairs in `args`.
//!
//! Nothing here depends on time or randomness, and no tool name is ever
//! invented: the last strategy only succeeds when a `tool` field was found.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::action::{Action, ActionError};
use crate::error::{InterpretError, ParseError};

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap());

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

static TOOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""tool"\s*:\s*"([A-Za-z_]+)""#).unwrap());

static THOUGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""thought"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

static ARGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""args"\s*:\s*\{([^}]*)"#).unwrap());

static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(\w+)"\s*:\s*(?:"((?:[^"\\]|\\.)*)"|(-?\d+(?:\.\d+)?)|(true|false))"#).unwrap()
});

const EXCERPT_CHARS: usize = 200;

/// Extract one action from raw model output.
pub fn parse(raw: &str) -> Result<Action, InterpretError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseError::Empty.into());
    }

    let sources = sources(text);
    let mut untooled = false;

    for source in &sources {
        match strict(source) {
            Scan::Found(result) => return result.map_err(InterpretError::from),
            Scan::Untooled => untooled = true,
            Scan::Nothing => {}
        }
    }

    for source in &sources {
        match strict(&repair(source)) {
            Scan::Found(result) => {
                tracing::debug!("recovered model output after textual repair");
                return result.map_err(InterpretError::from);
            }
            Scan::Untooled => untooled = true,
            Scan::Nothing => {}
        }
    }

    if let Some(result) = extract_fields(&repair(text)) {
        tracing::debug!("recovered model output by field extraction");
        return result.map_err(InterpretError::from);
    }

    if untooled {
        return Err(ActionError::MissingTool.into());
    }
    Err(ParseError::NoStructure {
        excerpt: text.chars().take(EXCERPT_CHARS).collect(),
    }
    .into())
}

/// Fenced block contents first (if any), then the whole text.
fn sources(text: &str) -> Vec<&str> {
    let mut sources = Vec::with_capacity(2);
    if let Some(block) = FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        sources.push(block.as_str().trim());
    }
    sources.push(text);
    sources
}

enum Scan {
    Found(Result<Action, ActionError>),
    /// JSON objects were present but none of them named a tool.
    Untooled,
    Nothing,
}

/// Try every object span in order; the first one carrying `tool` wins.
fn strict(source: &str) -> Scan {
    let mut untooled = false;
    for span in object_spans(source) {
        match serde_json::from_str::<Value>(span) {
            Ok(value @ Value::Object(_)) if value.get("tool").is_some() => {
                return Scan::Found(Action::from_wire(&value));
            }
            Ok(Value::Object(_)) => untooled = true,
            _ => {}
        }
    }
    if untooled { Scan::Untooled } else { Scan::Nothing }
}

/// End (exclusive) of the balanced object opening at `start`, skipping
/// braces inside string literals.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Top-level balanced `{...}` spans in document order, then the loose span
/// from the first `{` to the last `}` for output that never closes.
pub(crate) fn object_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(found) = text[cursor..].find('{') {
        let start = cursor + found;
        match balanced_end(text, start) {
            Some(end) => {
                spans.push(&text[start..end]);
                cursor = end;
            }
            None => cursor = start + 1,
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        let loose = &text[start..=end];
        if end > start && !spans.contains(&loose) {
            spans.push(loose);
        }
    }
    spans
}

fn repair(source: &str) -> String {
    let normalized: String = source
        .chars()
        .map(|ch| match ch {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '\r' | '\n' | '\t' => ' ',
            other => other,
        })
        .collect();
    TRAILING_COMMA_RE.replace_all(&normalized, "$1").into_owned()
}

fn extract_fields(text: &str) -> Option<Result<Action, ActionError>> {
    let tool = TOOL_RE.captures(text)?.get(1)?.as_str();

    let thought = THOUGHT_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()))
        .unwrap_or_default();

    let mut args = Map::new();
    if let Some(body) = ARGS_RE.captures(text).and_then(|c| c.get(1)) {
        for pair in PAIR_RE.captures_iter(body.as_str()) {
            let key = pair[1].to_string();
            let value = if let Some(s) = pair.get(2) {
                Value::String(unescape(s.as_str()))
            } else if let Some(n) = pair.get(3) {
                number(n.as_str())
            } else {
                Value::Bool(&pair[4] == "true")
            };
            args.insert(key, value);
        }
    }

    Some(Action::from_parts(thought, tool, &Value::Object(args)))
}

fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.to_string())
}

fn number(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}
