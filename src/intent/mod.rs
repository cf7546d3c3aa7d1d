//! Query intent parsing.
//!
//! Two paths produce the same [`SearchIntent`] shape: an LLM asked for a
//! fixed JSON schema, and a deterministic rule extractor. The LLM runs
//! under a hard deadline; any failure (unreachable, slow, bad JSON) drops
//! to the rules and flags `fallback_used` so callers can see which path
//! answered.

pub mod llm;
pub mod rules;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::config::IntentConfig;
use crate::fusion::Source;
pub use llm::{LlmClient, LlmError, OpenAiClient};

/// Deadline for rule-only parsers, where no completion ever runs.
const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// The dominant kind of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Keyword,
    Semantic,
    Time,
    Location,
    People,
    Mixed,
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentKind::Keyword => write!(f, "keyword"),
            IntentKind::Semantic => write!(f, "semantic"),
            IntentKind::Time => write!(f, "time"),
            IntentKind::Location => write!(f, "location"),
            IntentKind::People => write!(f, "people"),
            IntentKind::Mixed => write!(f, "mixed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Time,
    Location,
    Person,
    Emotion,
}

/// A concrete filter extracted from the query, e.g. a year or a name.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub value: String,
}

/// Structured interpretation of a free-form query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchIntent {
    #[serde(rename = "type")]
    pub kind: IntentKind,
    pub confidence: f32,
    pub entities: Vec<Entity>,
    /// Query text with structured filters stripped out, for the text
    /// strategies to match against.
    pub refined_query: String,
    /// Strategies worth running, best first.
    pub search_hints: Vec<Source>,
    /// True when the LLM was configured but the rules answered instead.
    pub fallback_used: bool,
    pub reasoning: Option<String>,
}

impl SearchIntent {
    /// The source fusion should favor, if the intent names one clearly.
    pub fn boost_source(&self) -> Option<Source> {
        match self.kind {
            IntentKind::People => Some(Source::People),
            IntentKind::Semantic => Some(Source::Semantic),
            IntentKind::Keyword => Some(Source::Keyword),
            IntentKind::Time | IntentKind::Location | IntentKind::Mixed => None,
        }
    }

    /// First four-digit time entity, as a year.
    pub fn year(&self) -> Option<i32> {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::Time)
            .find_map(|e| (e.value.len() == 4).then(|| e.value.parse().ok()).flatten())
    }

    /// First time entity in the 1-12 range, as a month.
    pub fn month(&self) -> Option<u32> {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::Time && e.value.len() <= 2)
            .find_map(|e| e.value.parse().ok())
            .filter(|m| (1..=12).contains(m))
    }

    pub fn person_names(&self) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|e| e.kind == EntityKind::Person)
            .map(|e| e.value.as_str())
            .collect()
    }
}

/// Strategy order implied by an intent when the parser names none.
pub(crate) fn derive_hints(kind: IntentKind, entities: &[Entity]) -> Vec<Source> {
    let wants_people =
        kind == IntentKind::People || entities.iter().any(|e| e.kind == EntityKind::Person);

    let mut hints = Vec::new();
    if wants_people {
        hints.push(Source::People);
    }
    hints.push(Source::Keyword);
    hints.push(Source::Semantic);
    hints
}

/// Parses queries into [`SearchIntent`], preferring the LLM when one is
/// configured and falling back to rules otherwise.
pub struct QueryIntentParser {
    client: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl QueryIntentParser {
    pub fn from_config(config: &IntentConfig) -> QueryIntentParser {
        if !config.llm.enabled {
            return QueryIntentParser::rules_only();
        }

        match OpenAiClient::from_config(&config.llm) {
            Ok(client) => QueryIntentParser {
                client: Some(Arc::new(client)),
                timeout: Duration::from_millis(config.llm.timeout_ms),
            },
            Err(err) => {
                log::warn!("LLM intent parsing disabled: {err}");
                QueryIntentParser::rules_only()
            }
        }
    }

    pub fn rules_only() -> QueryIntentParser {
        QueryIntentParser {
            client: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_client(client: Arc<dyn LlmClient>, timeout: Duration) -> QueryIntentParser {
        QueryIntentParser {
            client: Some(client),
            timeout,
        }
    }

    /// Parse a query. Never fails: any LLM problem degrades to the rule
    /// extractor, with `fallback_used` set on the result.
    pub fn parse(&self, query: &str) -> SearchIntent {
        let Some(client) = &self.client else {
            return rules::parse(query);
        };

        match self.ask_llm(client.clone(), query) {
            Ok(intent) => intent,
            Err(reason) => {
                log::debug!("LLM intent parse failed ({reason}), using rule fallback");
                let mut intent = rules::parse(query);
                intent.fallback_used = true;
                intent
            }
        }
    }

    fn ask_llm(&self, client: Arc<dyn LlmClient>, query: &str) -> Result<SearchIntent, String> {
        let (tx, rx) = mpsc::channel();
        let query = query.to_string();
        thread::spawn(move || {
            // Receiver may be gone after a timeout
            let _ = tx.send(llm::parse_with_client(client.as_ref(), &query));
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(intent)) => Ok(intent),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("no completion within {}ms", self.timeout.as_millis())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct FailingClient;

    impl LlmClient for FailingClient {
        fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Err(LlmError::Request("connection refused".to_string()))
        }
    }

    struct SlowClient;

    impl LlmClient for SlowClient {
        fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            thread::sleep(Duration::from_millis(500));
            Ok(r#"{"intent": "keyword", "confidence": 0.9}"#.to_string())
        }
    }

    struct GoodClient;

    impl LlmClient for GoodClient {
        fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Ok(r#"{
                "intent": "people",
                "entities": [{"type": "person", "value": "Alice"}],
                "strategy": ["people", "keyword"],
                "confidence": 0.95,
                "reasoning": "asks for a person"
            }"#
            .to_string())
        }
    }

    #[test]
    fn test_no_client_uses_rules_without_fallback_flag() {
        let parser = QueryIntentParser::rules_only();
        let intent = parser.parse("2023年和妈妈在日本旅游的照片");

        assert_eq!(intent.kind, IntentKind::Mixed);
        assert!(!intent.fallback_used);
    }

    #[test]
    fn test_llm_failure_falls_back_to_rules() {
        let parser =
            QueryIntentParser::with_client(Arc::new(FailingClient), Duration::from_millis(200));
        let intent = parser.parse("2023年和妈妈在日本旅游的照片");

        assert_eq!(intent.kind, IntentKind::Mixed);
        assert!(intent.fallback_used);
        assert!(intent.entities.iter().any(|e| e.value == "妈妈"));
    }

    #[test]
    fn test_slow_llm_hits_deadline() {
        let parser =
            QueryIntentParser::with_client(Arc::new(SlowClient), Duration::from_millis(50));

        let started = Instant::now();
        let intent = parser.parse("sunset");
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(intent.fallback_used);
        assert_eq!(intent.kind, IntentKind::Keyword);
    }

    #[test]
    fn test_llm_answer_is_used_directly() {
        let parser =
            QueryIntentParser::with_client(Arc::new(GoodClient), Duration::from_millis(500));
        let intent = parser.parse("photos of Alice");

        assert_eq!(intent.kind, IntentKind::People);
        assert!(!intent.fallback_used);
        assert_eq!(intent.person_names(), vec!["Alice"]);
        assert_eq!(intent.boost_source(), Some(Source::People));
    }

    #[test]
    fn test_year_month_accessors() {
        let parser = QueryIntentParser::rules_only();
        let intent = parser.parse("2021年12月的照片");

        assert_eq!(intent.year(), Some(2021));
        assert_eq!(intent.month(), Some(12));
    }

    #[test]
    fn test_disabled_config_parses_with_rules() {
        let config = IntentConfig::default();
        assert!(!config.llm.enabled);

        let parser = QueryIntentParser::from_config(&config);
        let intent = parser.parse("happy days");
        assert_eq!(intent.kind, IntentKind::Semantic);
        assert!(!intent.fallback_used);
    }
}
