//! Numbered prompt rendering and position-keyed merging of model assessments.
//!
//! Items go to the model as `Item 1:`, `Item 2:`, ... blocks. The model answers
//! with entries keyed by `item_number`; `correlate` maps those back onto the
//! exact batch that was rendered, so factual fields (titles, URLs) never have
//! to round-trip through the model.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

pub const ITEM_SEPARATOR: &str = "\n---\n";
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("`{0}` in model response is not an array")]
    NotAnArray(String),
}

/// Assessments carry the 1-based position of the item they judge.
pub trait Numbered {
    fn item_number(&self) -> Option<usize>;
}

/// At most `max` characters of `text`, cut on a char boundary.
pub fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// `Item {n}:` or `Item {n} [label]:` followed by the rendered fields.
pub fn numbered_block(n: usize, label: Option<&str>, body: &str) -> String {
    match label.filter(|l| !l.is_empty()) {
        Some(label) => format!("Item {} [{}]:\n{}", n, label, body),
        None => format!("Item {}:\n{}", n, body),
    }
}

/// Join blocks with the separator, clipping the whole prompt to `budget` characters.
pub fn join_blocks(blocks: &[String], budget: usize) -> String {
    let content = blocks.join(ITEM_SEPARATOR);
    if content.chars().count() > budget {
        format!("{}{}", clip(&content, budget), TRUNCATION_MARKER)
    } else {
        content
    }
}

/// Pair each assessment with the batch item at its position, in batch order.
///
/// Positions outside `1..=batch.len()` (or missing) are dropped. When two
/// assessments name the same position the later one wins.
pub fn correlate<'a, T, A: Numbered>(batch: &'a [T], assessments: Vec<A>) -> Vec<(&'a T, A)> {
    let mut by_position: BTreeMap<usize, A> = BTreeMap::new();
    for assessment in assessments {
        match assessment.item_number() {
            Some(n) if (1..=batch.len()).contains(&n) => {
                by_position.insert(n, assessment);
            }
            other => debug!(item_number = ?other, batch = batch.len(), "ignoring out-of-range assessment"),
        }
    }
    by_position
        .into_iter()
        .map(|(n, a)| (&batch[n - 1], a))
        .collect()
}

/// Decode the array at `key`, skipping entries that do not fit `A`.
/// A missing or null key is an empty selection.
pub fn assessments<A: DeserializeOwned>(response: &Value, key: &str) -> Result<Vec<A>, MergeError> {
    match response.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(entries)) => Ok(entries
            .iter()
            .filter_map(|entry| match A::deserialize(entry) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(key, error = %e, "skipping unreadable assessment");
                    None
                }
            })
            .collect()),
        Some(_) => Err(MergeError::NotAnArray(key.to_string())),
    }
}

/// Top-level text field of a model response; absent or odd values become text or "".
pub fn text_field(response: &Value, key: &str) -> String {
    response.get(key).map(value_to_text).unwrap_or_default()
}

/// Top-level count field; accepts integers, integral floats and numeric strings.
pub fn count_field(response: &Value, key: &str) -> u32 {
    response
        .get(key)
        .and_then(value_to_number)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn value_to_number(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().map(|u| u as usize).or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as usize)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// serde helper: `item_number` as integer, integral float or numeric string.
pub fn item_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(value_to_number(&v))
}

/// serde helper: any scalar as text, null as "".
pub fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(value_to_text(&v))
}

/// serde helper: a list of strings, or a single comma-separated string.
pub fn lenient_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(match v {
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    })
}
