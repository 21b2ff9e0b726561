//! The external vision judge.
//!
//! One trait, one remote implementation: send an image and a text prompt,
//! receive a small structured judgment back. The wire shape is an
//! OpenAI-compatible chat completion with an inline base64 image; nothing
//! beyond that is standardized, each backend owns its own protocol.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::JudgeConfig;

/// Judgment for one (image, query) pair. Pure function of its inputs by
/// contract, which is what makes the cache write-once safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(rename = "match")]
    pub matched: bool,
    pub confidence: f32,
    #[serde(default)]
    pub rationale: String,
}

impl Verdict {
    /// The degraded verdict used when a response cannot be parsed.
    pub fn unparseable() -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            rationale: "unparseable judge response".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge not configured: {0}")]
    Configuration(String),

    #[error("transient judge failure: {0}")]
    Transient(String),

    #[error("judge rejected request: {0}")]
    Permanent(String),
}

/// Vision-capable judge of whether a photo matches a query.
pub trait VisionJudge: Send + Sync {
    fn judge(&self, image_webp: &[u8], query: &str) -> Result<Verdict, JudgeError>;
}

const SYSTEM_PROMPT: &str = "You judge whether a photo matches a search query. \
Reply with strict JSON: {\"match\": bool, \"confidence\": number 0..1, \"rationale\": short string}. \
No other text.";

pub struct RemoteJudge {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl RemoteJudge {
    pub fn new(config: &JudgeConfig) -> Result<Self, JudgeError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            JudgeError::Configuration(format!("env var {} is not set", config.api_key_env))
        })?;
        if api_key.trim().is_empty() {
            return Err(JudgeError::Configuration(format!(
                "env var {} is empty",
                config.api_key_env
            )));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| JudgeError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

impl VisionJudge for RemoteJudge {
    fn judge(&self, image_webp: &[u8], query: &str) -> Result<Verdict, JudgeError> {
        let data_url = format!("data:image/webp;base64,{}", BASE64.encode(image_webp));

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": [
                    { "type": "image_url", "image_url": { "url": data_url } },
                    { "type": "text", "text": format!("Query: {query}") }
                ]}
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(JudgeError::Transient(format!("judge returned {status}")));
        }
        if !status.is_success() {
            return Err(JudgeError::Permanent(format!("judge returned {status}")));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| JudgeError::Transient(format!("malformed response body: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        Ok(parse_verdict(&content))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> JudgeError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        JudgeError::Transient(e.to_string())
    } else {
        JudgeError::Permanent(e.to_string())
    }
}

/// Parse the judge's reply against the fixed schema.
///
/// Models wrap JSON in prose or code fences often enough that we extract the
/// outermost brace pair first. Anything unparseable degrades to the
/// no-match/zero-confidence verdict so one bad reply cannot abort a batch.
pub fn parse_verdict(content: &str) -> Verdict {
    let candidate = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => return Verdict::unparseable(),
    };

    match serde_json::from_str::<Verdict>(candidate) {
        Ok(mut verdict) => {
            verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
            verdict
        }
        Err(e) => {
            log::warn!("judge response did not match schema: {e}");
            Verdict::unparseable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_plain_json() {
        let v = parse_verdict(r#"{"match": true, "confidence": 0.85, "rationale": "red car visible"}"#);
        assert!(v.matched);
        assert!((v.confidence - 0.85).abs() < 1e-6);
        assert_eq!(v.rationale, "red car visible");
    }

    #[test]
    fn test_parse_verdict_code_fenced() {
        let v = parse_verdict("```json\n{\"match\": false, \"confidence\": 0.1}\n```");
        assert!(!v.matched);
        assert!((v.confidence - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_parse_verdict_garbage_degrades() {
        let v = parse_verdict("I cannot answer that.");
        assert_eq!(v, Verdict::unparseable());
        assert!(!v.matched);
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn test_parse_verdict_wrong_schema_degrades() {
        let v = parse_verdict(r#"{"answer": "yes"}"#);
        assert_eq!(v, Verdict::unparseable());
    }

    #[test]
    fn test_parse_verdict_clamps_confidence() {
        let v = parse_verdict(r#"{"match": true, "confidence": 3.5}"#);
        assert_eq!(v.confidence, 1.0);

        let v = parse_verdict(r#"{"match": true, "confidence": -0.5}"#);
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn test_remote_judge_missing_credentials() {
        let mut config = JudgeConfig::default();
        config.api_key_env = "FOTOSEEK_TEST_JUDGE_KEY_NOT_SET".to_string();
        assert!(matches!(
            RemoteJudge::new(&config),
            Err(JudgeError::Configuration(_))
        ));
    }
}
