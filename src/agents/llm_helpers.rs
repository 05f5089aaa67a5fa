//! Parsing structured output out of free-form LLM replies

use crate::agents::Stage;
use crate::error::StageError;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Deserialize the first JSON value found in an LLM reply.
///
/// Tries, in order: the whole reply, the body of a fenced code block, and
/// the first well-formed object or array embedded in surrounding prose.
pub fn parse_llm_json<T: DeserializeOwned>(stage: Stage, reply: &str) -> Result<T, StageError> {
    let value = extract_json(reply).ok_or_else(|| {
        StageError::validation(stage, "LLM reply did not contain a JSON value")
    })?;

    serde_json::from_value(value).map_err(|e| {
        StageError::validation(stage, format!("LLM reply had an unexpected shape: {e}"))
    })
}

/// Locate and parse the first JSON object or array in `text`
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return Some(value);
        }
    }

    first_embedded_value(trimmed)
}

/// Body of the first ``` fenced block, with any language tag dropped
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// Longest prefix of `text` holding at most `max_chars` characters
pub fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn first_embedded_value(text: &str) -> Option<Value> {
    for (index, ch) in text.char_indices() {
        if ch != '{' && ch != '[' {
            continue;
        }
        // Parse one value from here and ignore whatever prose follows it
        let mut stream = serde_json::Deserializer::from_str(&text[index..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Trade {
        trade: String,
    }

    #[test]
    fn test_raw_json() {
        let trades: Vec<Trade> = parse_llm_json(Stage::TradeMapper, r#"[{"trade":"Drywall"}]"#).unwrap();
        assert_eq!(trades, vec![Trade { trade: "Drywall".into() }]);
    }

    #[test]
    fn test_fenced_json_with_language_tag() {
        let reply = "Here you go:\n```json\n{\"trade\": \"Electrical\"}\n```\nLet me know.";
        let trade: Trade = parse_llm_json(Stage::TradeMapper, reply).unwrap();
        assert_eq!(trade.trade, "Electrical");
    }

    #[test]
    fn test_embedded_array_in_prose() {
        let reply = "The trades are [{\"trade\":\"Concrete\"}] based on sheet S-101.";
        let trades: Vec<Trade> = parse_llm_json(Stage::TradeMapper, reply).unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[test]
    fn test_skips_unbalanced_brace_before_real_value() {
        let reply = "note {not json} then {\"trade\":\"Roofing\"}";
        let trade: Trade = parse_llm_json(Stage::TradeMapper, reply).unwrap();
        assert_eq!(trade.trade, "Roofing");
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("abcdef", 3), "abc");
        assert_eq!(clip("ab", 3), "ab");
        assert_eq!(clip("ééé", 2), "éé");
    }

    #[test]
    fn test_no_json_is_validation_error() {
        let err = parse_llm_json::<Trade>(Stage::Scope, "I could not find any trades.").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
        assert_eq!(err.stage, Some(Stage::Scope));
    }

    #[test]
    fn test_wrong_shape_is_validation_error() {
        let err = parse_llm_json::<Vec<Trade>>(Stage::Scope, r#"{"trade":"x"}"#).unwrap_err();
        assert!(err.message.contains("unexpected shape"));
    }
}
