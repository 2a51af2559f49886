//! Defensive decoding of model output that should be JSON.
//!
//! Text models wrap structured answers in prose or code fences, and under
//! token limits they stop mid-structure. [`repair_json`] normalizes the text
//! through a fixed table of steps, then tries a small ordered set of
//! [`RepairStrategy`] values until one decodes. It never fails: when nothing
//! decodes, the caller's default comes back unchanged.
//!
//! # Example
//!
//! ```
//! use slidegen::repair::repair_json;
//! use serde_json::{json, Value};
//!
//! let text = r#"[{"title":"A"},{"title":"B"},{"title":"C"#;
//! let slides: Value = repair_json(text, json!([]));
//! assert_eq!(slides, json!([{"title": "A"}, {"title": "B"}]));
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

// ============================================================================
// Structure detection
// ============================================================================

/// Top-level shape of the payload, decided by the first opening bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    Array,
}

impl Shape {
    fn closer(self) -> char {
        match self {
            Self::Object => '}',
            Self::Array => ']',
        }
    }
}

/// Result of bracket scanning over the normalized text.
#[derive(Debug, Default)]
struct ScanMarks {
    /// Byte index just past the bracket that closes the top-level structure.
    top_close: Option<usize>,
    /// Byte index just past the last element that closed at array depth.
    last_element_close: Option<usize>,
}

/// Walk the text tracking string state and nesting depth.
///
/// Brackets inside quoted spans are ignored.
fn scan(text: &str) -> ScanMarks {
    let mut marks = ScanMarks::default();
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, byte) in text.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    marks.last_element_close = Some(idx + 1);
                } else if depth == 0 {
                    marks.top_close = Some(idx + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    marks
}

// ============================================================================
// Normalization steps
// ============================================================================

type Normalizer = fn(String) -> String;

/// Normalization applied before any decode attempt, in order.
const NORMALIZERS: &[(&str, Normalizer)] = &[
    ("strip-fences", strip_fences),
    ("skip-leading-prose", skip_leading_prose),
    ("close-truncated", close_truncated),
];

fn strip_fences(text: String) -> String {
    text.replace("```json", "").replace("```", "").trim().to_string()
}

fn detect_shape(text: &str) -> Option<(usize, Shape)> {
    let brace = text.find('{');
    let bracket = text.find('[');
    match (brace, bracket) {
        (Some(b), Some(k)) if k < b => Some((k, Shape::Array)),
        (Some(b), _) => Some((b, Shape::Object)),
        (None, Some(k)) => Some((k, Shape::Array)),
        (None, None) => None,
    }
}

fn skip_leading_prose(text: String) -> String {
    match detect_shape(&text) {
        Some((start, _)) if start > 0 => text[start..].to_string(),
        _ => text,
    }
}

/// Cut trailing prose after a complete structure, or drop an incomplete
/// trailing element and close the array.
fn close_truncated(text: String) -> String {
    let Some((_, shape)) = detect_shape(&text) else {
        return text;
    };
    if text.ends_with(shape.closer()) {
        return text;
    }

    let marks = scan(&text);
    if let Some(end) = marks.top_close {
        return text[..end].to_string();
    }

    match shape {
        Shape::Array => {
            let cut = marks
                .last_element_close
                .or_else(|| text.rfind('}').map(|i| i + 1));
            match cut {
                Some(end) => format!("{}]", &text[..end]),
                None => text,
            }
        }
        Shape::Object => match text.rfind('}') {
            Some(i) => text[..=i].to_string(),
            None => text,
        },
    }
}

/// Run every normalization step over the raw text.
#[must_use]
pub fn normalize(text: &str) -> String {
    NORMALIZERS
        .iter()
        .fold(text.trim().to_string(), |acc, (_, step)| step(acc))
}

// ============================================================================
// Decode strategies
// ============================================================================

/// A decode attempt over normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    /// Decode the normalized text as-is.
    Strict,
    /// Escape literal newline, carriage return and tab found inside quoted
    /// strings, then decode.
    EscapeControlChars,
}

impl RepairStrategy {
    /// Strategies in the order they are attempted.
    pub const ORDER: [Self; 2] = [Self::Strict, Self::EscapeControlChars];

    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::EscapeControlChars => "escape-control-chars",
        }
    }

    fn attempt(&self, text: &str) -> Result<Value, serde_json::Error> {
        match self {
            Self::Strict => serde_json::from_str(text),
            Self::EscapeControlChars => serde_json::from_str(&escape_controls_in_strings(text)),
        }
    }
}

/// Escape raw control characters that sit inside string literals.
///
/// Characters outside strings are left untouched.
#[must_use]
pub fn escape_controls_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

/// Decode to an untyped value, reporting which strategy succeeded.
///
/// Returns `None` when every strategy fails.
#[must_use]
pub fn repair_value(text: &str) -> Option<(Value, RepairStrategy)> {
    if text.trim().is_empty() {
        return None;
    }
    let normalized = normalize(text);
    let mut last_error = None;
    for strategy in RepairStrategy::ORDER {
        match strategy.attempt(&normalized) {
            Ok(value) => {
                if strategy != RepairStrategy::Strict {
                    debug!(strategy = strategy.name(), "Recovered malformed JSON response");
                }
                return Some((value, strategy));
            }
            Err(e) => last_error = Some(e),
        }
    }
    if let Some(e) = last_error {
        warn!(error = %e, chars = text.len(), "Failed to decode JSON response");
    }
    None
}

/// Decode `text` into `T`, falling back to `default` on any failure.
///
/// Never panics and never returns an error.
pub fn repair_json<T: DeserializeOwned>(text: &str, default: T) -> T {
    let Some((value, _)) = repair_value(text) else {
        return default;
    };
    match serde_json::from_value(value) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(error = %e, "Decoded JSON did not match the expected shape");
            default
        }
    }
}
