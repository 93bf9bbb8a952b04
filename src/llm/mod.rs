//! LLM completion service seam.

mod openai;

pub use openai::OpenAIChatClient;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{KgragError, Result};

/// Chat-completion model used for planning, answering and ontology refinement.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete `prompt` under the `system` instructions.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    fn name(&self) -> &str {
        "llm"
    }

    /// Why this model cannot serve requests, if it cannot.
    fn unavailable_reason(&self) -> Option<&str> {
        None
    }
}

/// Stand-in for a chat client that could not be configured. Every call fails
/// with the configuration problem; builds skip refinement.
#[derive(Debug, Clone)]
pub struct UnavailableModel {
    reason: String,
}

impl UnavailableModel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

#[async_trait]
impl LanguageModel for UnavailableModel {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        Err(KgragError::Llm(format!("LLM unavailable: {}", self.reason)))
    }

    fn name(&self) -> &str {
        "unavailable"
    }

    fn unavailable_reason(&self) -> Option<&str> {
        Some(&self.reason)
    }
}

/// Run one completion under a deadline. Elapsed deadlines surface as
/// `PlanningTimeout` so callers can decide whether to retry.
pub async fn complete_with_timeout(
    llm: &dyn LanguageModel,
    system: &str,
    prompt: &str,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, llm.complete(system, prompt)).await {
        Ok(result) => result,
        Err(_) => Err(KgragError::PlanningTimeout(timeout.as_secs())),
    }
}

/// Cut `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Pull the JSON payload out of a model reply: drops markdown fences and any
/// prose before the first `{` or after the matching last `}`.
pub fn extract_json(reply: &str) -> &str {
    let mut text = reply.trim();

    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        text = rest.trim_start();
        if let Some(end) = text.rfind("```") {
            text = &text[..end];
        }
        text = text.trim();
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedModel;
    use super::*;

    #[test]
    fn test_extract_json_strips_fences() {
        let reply = "```json\n{\"action\": \"finish\"}\n```";
        assert_eq!(extract_json(reply), "{\"action\": \"finish\"}");

        let reply = "Sure! Here it is: {\"a\": {\"b\": 1}} hope that helps";
        assert_eq!(extract_json(reply), "{\"a\": {\"b\": 1}}");

        assert_eq!(extract_json("no json"), "no json");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_timeout_maps_to_planning_timeout() {
        let model = ScriptedModel::new(vec!["late"]).with_delay(Duration::from_millis(200));
        let err = complete_with_timeout(&model, "sys", "prompt", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "planning_timeout");
    }

    #[tokio::test]
    async fn test_unavailable_model_reports_reason() {
        let model = UnavailableModel::new("OPENAI_API_KEY not set");
        assert_eq!(model.unavailable_reason(), Some("OPENAI_API_KEY not set"));
        let err = model.complete("sys", "prompt").await.unwrap_err();
        assert_eq!(err.kind(), "llm");
        assert!(err.to_string().contains("OPENAI_API_KEY not set"));

        let scripted = ScriptedModel::new(vec![]);
        assert!(scripted.unavailable_reason().is_none());
    }
}
