//! LLM seam used by the pipeline.

use crate::error::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("fenced json pattern")
});
static FENCED_ANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(\{.*?\})\s*```").expect("fenced pattern"));
static OUTER_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)(\{.*\})").expect("object pattern"));

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct JsonCompletion {
    pub json: Value,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct TextCompletion {
    pub text: String,
    pub usage: Usage,
}

/// A chat model that answers a single prompt.
///
/// Failures come back as `Error::Provider`. Implementations own their retry
/// policy; callers never retry.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_name(&self) -> &str;

    /// Ask for a JSON object. Answers without an extractable object fail.
    async fn complete_json(&self, prompt: &str) -> Result<JsonCompletion>;

    /// Ask for free text.
    async fn complete_text(&self, prompt: &str) -> Result<TextCompletion>;
}

/// Pull a JSON object out of a model answer.
///
/// Tries a ```json fence, any fence, the outermost braces, then the whole
/// text. Empty objects count as a miss.
pub fn extract_json(text: &str) -> Option<Value> {
    let candidates = [&*FENCED_JSON_RE, &*FENCED_ANY_RE, &*OUTER_OBJECT_RE]
        .into_iter()
        .filter_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .chain(std::iter::once(text.trim()));

    for candidate in candidates {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.as_object().is_some_and(|map| !map.is_empty()) {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_fenced_json() {
        let text = "Вот результат:\n```json\n{\"a\": 1}\n```\nи ещё {\"b\": 2}";
        assert_eq!(extract_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn test_extract_plain_fence_and_braces() {
        assert_eq!(extract_json("```\n{\"a\": [1]}\n```"), Some(json!({"a": [1]})));
        assert_eq!(
            extract_json("Ответ: {\"S\": {\"P\": {\"значение\": 5}}} конец"),
            Some(json!({"S": {"P": {"значение": 5}}}))
        );
    }

    #[test]
    fn test_extract_falls_through_bad_candidates() {
        // The fence holds broken JSON; the whole answer is still not an object.
        assert_eq!(extract_json("```json\n{\"a\": }\n```"), None);
        assert_eq!(extract_json("{}"), None);
        assert_eq!(extract_json("[1, 2]"), None);
        assert_eq!(extract_json("no json here"), None);
    }
}
