//! Model voices: an OpenAI-compatible HTTP client and offline scripted voices.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deliberation::{Citation, ModelClient, ModelDraft, ModelError, Role, VoiceId};
use tracing::debug;

/// System prompt for a role turn.
fn system_prompt(role: Role) -> &'static str {
    match role {
        Role::Hypothesis => {
            "You are the hypothesis voice of a deliberation council. Propose a concrete patch \
             plan for the goal in the context. Reply with a JSON object \
             {\"content\": string, \"citations\": [{\"url\": string, \"hash\": string?}], \
             \"score\": number, \"continue\": boolean}."
        }
        Role::Critique => {
            "You are the critique voice of a deliberation council. Find risks, missing tests \
             and missing citations in the proposed plan. Reply with a JSON object \
             {\"content\": string, \"citations\": [{\"url\": string, \"hash\": string?}], \
             \"score\": number, \"continue\": boolean}."
        }
        Role::Arbiter => {
            "You are the arbiter of a deliberation council. Synthesize the plan and its \
             critique into a decision, cite the sources it rests on, and give a final score \
             between 0 and 1. Reply with a JSON object \
             {\"content\": string, \"citations\": [{\"url\": string, \"hash\": string?}], \
             \"score\": number, \"continue\": boolean}."
        }
    }
}

/// Interpret a model reply. JSON replies (optionally fenced) become full
/// drafts; anything else is taken as plain content with no citations.
pub fn parse_reply(reply: &str) -> ModelDraft {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match serde_json::from_str::<ModelDraft>(body) {
        Ok(draft) if !draft.content.trim().is_empty() => draft,
        _ => ModelDraft {
            content: trimmed.to_string(),
            ..Default::default()
        },
    }
}

/// Voice backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpModelClient {
    base_url: String,
    api_key: Option<String>,
    models: HashMap<VoiceId, String>,
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        models: HashMap<VoiceId, String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            models,
            client,
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn draft(
        &self,
        voice: VoiceId,
        role: Role,
        context: &str,
    ) -> Result<ModelDraft, ModelError> {
        let model = self
            .models
            .get(&voice)
            .ok_or(ModelError::Unavailable(voice))?;

        let body = serde_json::json!({
            "model": model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": system_prompt(role) },
                { "role": "user", "content": context }
            ]
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::RequestFailed(format!(
                "model API error ({}): {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::ParseError(e.to_string()))?;

        let reply = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ModelError::ParseError("reply has no message content".to_string()))?;

        debug!(%voice, %role, model = %model, chars = reply.len(), "Model replied");
        Ok(parse_reply(reply))
    }
}

/// Deterministic offline voices for demos and local runs.
///
/// Hypothesis scores 0.88 uncited; critique and arbiter cite the incentive
/// spec; the arbiter scores 0.93, so a default policy halts in round one.
#[derive(Debug, Clone, Default)]
pub struct ScriptedVoices;

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl ModelClient for ScriptedVoices {
    async fn draft(
        &self,
        _voice: VoiceId,
        role: Role,
        context: &str,
    ) -> Result<ModelDraft, ModelError> {
        let content = match role {
            Role::Hypothesis => format!("HYPOTHESIS: propose patch plan for: {}", context),
            Role::Critique => format!(
                "CRITIQUE: find risks, missing tests, missing citations: {}",
                context
            ),
            Role::Arbiter => format!(
                "ARBITER: synthesize and decide; include citations and a final score for: {}",
                context
            ),
        };
        let citations = match role {
            Role::Hypothesis => Vec::new(),
            _ => vec![Citation::new("/specs/07-incentives-gic.md").with_hash("sha256:abc123")],
        };
        let score = if role == Role::Arbiter { 0.93 } else { 0.88 };

        Ok(ModelDraft {
            content: collapse_whitespace(&content),
            citations,
            score: Some(score),
            continue_hint: Some(score < 0.92),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_reply() {
        let draft = parse_reply(
            r#"{"content":"do it","citations":[{"url":"/a"}],"score":0.9,"continue":false}"#,
        );
        assert_eq!(draft.content, "do it");
        assert_eq!(draft.citations.len(), 1);
        assert_eq!(draft.score, Some(0.9));
        assert_eq!(draft.continue_hint, Some(false));
    }

    #[test]
    fn test_parse_fenced_reply() {
        let draft = parse_reply("```json\n{\"content\":\"fenced\",\"score\":0.7}\n```");
        assert_eq!(draft.content, "fenced");
        assert_eq!(draft.score, Some(0.7));
    }

    #[test]
    fn test_plain_text_fallback() {
        let draft = parse_reply("  just prose, no json  ");
        assert_eq!(draft.content, "just prose, no json");
        assert!(draft.citations.is_empty());
        assert!(draft.score.is_none());
    }

    #[tokio::test]
    async fn test_scripted_voices() {
        let voices = ScriptedVoices;
        let h = voices
            .draft(VoiceId::OaaLlmA, Role::Hypothesis, "goal=x   proposalRef=y")
            .await
            .unwrap();
        assert_eq!(h.content, "HYPOTHESIS: propose patch plan for: goal=x proposalRef=y");
        assert!(h.citations.is_empty());
        assert_eq!(h.continue_hint, Some(true));

        let a = voices
            .draft(VoiceId::OaaLlmC, Role::Arbiter, "ctx")
            .await
            .unwrap();
        assert_eq!(a.score, Some(0.93));
        assert_eq!(a.citations[0].hash.as_deref(), Some("sha256:abc123"));
    }

    #[tokio::test]
    async fn test_unconfigured_voice_is_unavailable() {
        let client = HttpModelClient::new(
            "http://127.0.0.1:9",
            None,
            HashMap::new(),
            Duration::from_secs(1),
        )
        .unwrap();
        let err = client
            .draft(VoiceId::OaaLlmA, Role::Hypothesis, "ctx")
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(VoiceId::OaaLlmA)));
    }
}
