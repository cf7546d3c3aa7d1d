//! LLM-backed intent extraction.
//!
//! Talks to any OpenAI-compatible chat completion endpoint and asks for a
//! fixed JSON schema. Everything that comes back is validated before it is
//! trusted; any deviation is an error so the caller can fall back to rules.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use super::{derive_hints, rules, Entity, EntityKind, IntentKind, SearchIntent};
use crate::config::LlmConfig;
use crate::fusion::Source;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("api key env var {0} is not set")]
    MissingApiKey(String),
    #[error("unusable completion: {0}")]
    BadResponse(String),
}

/// A chat completion backend. `complete` blocks until the model answers.
pub trait LlmClient: Send + Sync {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

const SCHEMA_PROMPT: &str = r#"You are a photo search query analyzer. Extract structured intent from the user's query and respond with JSON only, exactly in this shape:
{
  "intent": "keyword|semantic|time|location|people|mixed",
  "entities": [{"type": "time|location|person|emotion", "value": "..."}],
  "strategy": ["keyword", "semantic", "people"],
  "confidence": 0.0,
  "reasoning": "one short sentence"
}
Rules:
- "intent" is the dominant kind of query; use "mixed" when several kinds combine.
- "entities" lists every concrete filter found in the query, values kept in their original language.
- "strategy" names the search strategies worth running, best first.
- "confidence" is your certainty in [0, 1].
Queries may be in any language, including Chinese."#;

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(config.api_key_env.clone()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| LlmError::Request(err.to_string()))?;

        Ok(OpenAiClient {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system_prompt },
                    { "role": "user", "content": user_prompt },
                ],
                "temperature": 0.0,
            }))
            .send()
            .map_err(|err| LlmError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Request(format!("HTTP {}", response.status())));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|err| LlmError::BadResponse(err.to_string()))?;

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(|content| content.to_string())
            .ok_or_else(|| LlmError::BadResponse("no message content in completion".to_string()))
    }
}

#[derive(Deserialize, Debug)]
struct IntentResponse {
    intent: String,
    #[serde(default)]
    entities: Vec<EntityResponse>,
    #[serde(default)]
    strategy: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct EntityResponse {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

fn default_confidence() -> f32 {
    0.5
}

/// Run one completion and map it to a validated [`SearchIntent`].
pub(crate) fn parse_with_client(
    client: &dyn LlmClient,
    query: &str,
) -> Result<SearchIntent, LlmError> {
    let raw = client.complete(SCHEMA_PROMPT, query)?;
    let json = extract_json(&raw)
        .ok_or_else(|| LlmError::BadResponse("no JSON object in completion".to_string()))?;
    let response: IntentResponse = serde_json::from_str(json)
        .map_err(|err| LlmError::BadResponse(format!("malformed intent JSON: {err}")))?;
    build_intent(query, response)
}

fn build_intent(query: &str, response: IntentResponse) -> Result<SearchIntent, LlmError> {
    let kind = parse_intent_kind(&response.intent)
        .ok_or_else(|| LlmError::BadResponse(format!("unknown intent '{}'", response.intent)))?;

    let mut entities = Vec::new();
    for entity in response.entities {
        match parse_entity_kind(&entity.kind) {
            Some(kind) if !entity.value.trim().is_empty() => entities.push(Entity {
                kind,
                value: entity.value.trim().to_string(),
            }),
            _ => log::debug!("Dropping unrecognized entity {entity:?}"),
        }
    }

    let mut search_hints = Vec::new();
    for name in &response.strategy {
        match parse_strategy(name) {
            Some(source) if !search_hints.contains(&source) => search_hints.push(source),
            Some(_) => {}
            None => log::debug!("Dropping unrecognized strategy {name:?}"),
        }
    }
    if search_hints.is_empty() {
        search_hints = derive_hints(kind, &entities);
    }

    let refined_query = rules::strip_terms(
        query,
        entities
            .iter()
            .filter(|e| e.kind != EntityKind::Emotion)
            .map(|e| e.value.as_str()),
    );

    Ok(SearchIntent {
        kind,
        confidence: response.confidence.clamp(0.0, 1.0),
        entities,
        refined_query,
        search_hints,
        fallback_used: false,
        reasoning: response.reasoning.filter(|reason| !reason.trim().is_empty()),
    })
}

/// Slice out the outermost `{...}`, tolerating code fences and prose
/// around the object.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end >= start).then(|| &raw[start..=end])
}

fn parse_intent_kind(name: &str) -> Option<IntentKind> {
    match name.trim().to_lowercase().as_str() {
        "keyword" => Some(IntentKind::Keyword),
        "semantic" => Some(IntentKind::Semantic),
        "time" => Some(IntentKind::Time),
        "location" => Some(IntentKind::Location),
        "people" | "person" => Some(IntentKind::People),
        "mixed" => Some(IntentKind::Mixed),
        _ => None,
    }
}

fn parse_entity_kind(name: &str) -> Option<EntityKind> {
    match name.trim().to_lowercase().as_str() {
        "time" | "date" => Some(EntityKind::Time),
        "location" | "place" => Some(EntityKind::Location),
        "person" | "people" => Some(EntityKind::Person),
        "emotion" | "mood" => Some(EntityKind::Emotion),
        _ => None,
    }
}

fn parse_strategy(name: &str) -> Option<Source> {
    match name.trim().to_lowercase().as_str() {
        "keyword" => Some(Source::Keyword),
        "semantic" | "vector" => Some(Source::Semantic),
        "people" | "person" => Some(Source::People),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedClient(String);

    impl LlmClient for CannedClient {
        fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parses_schema_response() {
        let client = CannedClient(
            r#"{
                "intent": "mixed",
                "entities": [
                    {"type": "time", "value": "2023"},
                    {"type": "person", "value": "妈妈"},
                    {"type": "location", "value": "日本"}
                ],
                "strategy": ["people", "keyword"],
                "confidence": 0.92,
                "reasoning": "year, relative and country present"
            }"#
            .to_string(),
        );

        let intent = parse_with_client(&client, "2023年和妈妈在日本旅游的照片").unwrap();
        assert_eq!(intent.kind, IntentKind::Mixed);
        assert_eq!(intent.entities.len(), 3);
        assert_eq!(intent.search_hints, vec![Source::People, Source::Keyword]);
        assert!((intent.confidence - 0.92).abs() < 1e-6);
        assert!(!intent.fallback_used);
        assert!(intent.reasoning.is_some());
        assert!(!intent.refined_query.contains("妈妈"));
    }

    #[test]
    fn test_tolerates_code_fences() {
        let client = CannedClient(
            "```json\n{\"intent\": \"keyword\", \"confidence\": 0.8}\n```".to_string(),
        );

        let intent = parse_with_client(&client, "sunset").unwrap();
        assert_eq!(intent.kind, IntentKind::Keyword);
        assert_eq!(intent.refined_query, "sunset");
    }

    #[test]
    fn test_unknown_intent_is_error() {
        let client = CannedClient(r#"{"intent": "browse", "confidence": 0.5}"#.to_string());
        assert!(matches!(
            parse_with_client(&client, "anything"),
            Err(LlmError::BadResponse(_))
        ));
    }

    #[test]
    fn test_non_json_completion_is_error() {
        let client = CannedClient("I could not understand the query.".to_string());
        assert!(matches!(
            parse_with_client(&client, "anything"),
            Err(LlmError::BadResponse(_))
        ));
    }

    #[test]
    fn test_unknown_entities_dropped_and_hints_derived() {
        let client = CannedClient(
            r#"{
                "intent": "people",
                "entities": [
                    {"type": "person", "value": "Alice"},
                    {"type": "weather", "value": "rainy"}
                ],
                "strategy": [],
                "confidence": 0.7
            }"#
            .to_string(),
        );

        let intent = parse_with_client(&client, "Alice in the rain").unwrap();
        assert_eq!(intent.entities.len(), 1);
        assert_eq!(intent.entities[0].value, "Alice");
        assert_eq!(
            intent.search_hints,
            vec![Source::People, Source::Keyword, Source::Semantic]
        );
    }

    #[test]
    fn test_confidence_clamped() {
        let client = CannedClient(r#"{"intent": "keyword", "confidence": 3.5}"#.to_string());
        let intent = parse_with_client(&client, "query").unwrap();
        assert!((intent.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_extract_json_spans_outer_object() {
        assert_eq!(extract_json(r#"noise {"a": {"b": 1}} tail"#), Some(r#"{"a": {"b": 1}}"#));
        assert_eq!(extract_json("no object"), None);
    }
}
