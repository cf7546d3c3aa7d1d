//! Rule-based query intent extraction.
//!
//! The deterministic fallback behind the LLM parser: year/month patterns,
//! relationship words for person references, a fixed location gazetteer
//! and an emotion word list. Near-instant, works offline, and handles
//! mixed Chinese/English queries.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{derive_hints, Entity, EntityKind, IntentKind, SearchIntent};

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:19|20)[0-9]{2}").unwrap());
static CJK_MONTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:1[0-2]|0?[1-9])月").unwrap());

/// Kinship and role words treated as person references.
const RELATIONSHIP_TERMS: &[&str] = &[
    "妈妈", "爸爸", "爷爷", "奶奶", "外公", "外婆", "哥哥", "姐姐", "弟弟", "妹妹", "叔叔",
    "阿姨", "儿子", "女儿", "宝宝", "老婆", "老公",
];
const RELATIONSHIP_WORDS: &[&str] = &[
    "mom", "mum", "mother", "dad", "father", "grandma", "grandpa", "grandmother", "grandfather",
    "brother", "sister", "son", "daughter", "wife", "husband", "baby", "aunt", "uncle",
];

/// Fixed gazetteer of location keywords.
const LOCATION_TERMS: &[&str] = &[
    "日本", "中国", "北京", "上海", "东京", "美国", "香港", "台湾", "首尔", "巴黎", "伦敦",
    "泰国", "新加坡", "公园", "海边", "学校",
];
const LOCATION_WORDS: &[&str] = &[
    "japan", "china", "beijing", "shanghai", "tokyo", "america", "usa", "paris", "london",
    "korea", "seoul", "thailand", "singapore", "hawaii", "beach", "park", "school",
];

const EMOTION_TERMS: &[&str] = &[
    "开心", "快乐", "幸福", "难过", "伤心", "温馨", "浪漫", "怀念", "美好",
];
const EMOTION_WORDS: &[&str] = &[
    "happy", "joyful", "fun", "funny", "sad", "love", "lovely", "romantic", "nostalgic",
    "cozy", "peaceful", "warm", "excited",
];

const ENGLISH_MONTHS: &[&str] = &[
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

/// Extract intent from a query without any model in the loop.
pub fn parse(query: &str) -> SearchIntent {
    let mut entities: Vec<Entity> = Vec::new();
    let mut emotions: Vec<Entity> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    extract_years(query, &mut entities, &mut spans);
    extract_months(query, &mut entities, &mut spans);
    extract_terms(
        query,
        RELATIONSHIP_TERMS,
        RELATIONSHIP_WORDS,
        EntityKind::Person,
        &mut entities,
        &mut spans,
    );
    extract_terms(
        query,
        LOCATION_TERMS,
        LOCATION_WORDS,
        EntityKind::Location,
        &mut entities,
        &mut spans,
    );
    // Emotion words stay in the refined query: they carry the semantic
    // signal instead of acting as a structured filter.
    let mut emotion_spans = Vec::new();
    extract_terms(
        query,
        EMOTION_TERMS,
        EMOTION_WORDS,
        EntityKind::Emotion,
        &mut emotions,
        &mut emotion_spans,
    );

    let kind = if !entities.is_empty() {
        IntentKind::Mixed
    } else if !emotions.is_empty() {
        IntentKind::Semantic
    } else {
        IntentKind::Keyword
    };
    let confidence = match kind {
        IntentKind::Mixed => 0.7,
        IntentKind::Semantic => 0.6,
        _ => 0.5,
    };

    let refined = strip_spans(query, &mut spans);
    let refined_query = if refined.trim().is_empty() {
        query.trim().to_string()
    } else {
        refined
    };

    entities.extend(emotions);
    let search_hints = derive_hints(kind, &entities);

    SearchIntent {
        kind,
        confidence,
        entities,
        refined_query,
        search_hints,
        fallback_used: false,
        reasoning: None,
    }
}

/// Remove every occurrence of the given terms from the query, collapsing
/// leftover whitespace. Falls back to the original query when nothing
/// would remain.
pub(crate) fn strip_terms<'a>(query: &str, terms: impl Iterator<Item = &'a str>) -> String {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for term in terms {
        if term.is_empty() {
            continue;
        }
        for (start, matched) in query.match_indices(term) {
            spans.push((start, start + matched.len()));
        }
    }

    let refined = strip_spans(query, &mut spans);
    if refined.trim().is_empty() {
        query.trim().to_string()
    } else {
        refined
    }
}

fn extract_years(query: &str, entities: &mut Vec<Entity>, spans: &mut Vec<(usize, usize)>) {
    let bytes = query.as_bytes();
    for m in YEAR_RE.find_iter(query) {
        // Skip matches embedded in longer digit runs
        if m.start() > 0 && bytes[m.start() - 1].is_ascii_digit() {
            continue;
        }
        if m.end() < bytes.len() && bytes[m.end()].is_ascii_digit() {
            continue;
        }

        let mut end = m.end();
        if query[end..].starts_with('年') {
            end += '年'.len_utf8();
        }
        push_entity(entities, EntityKind::Time, m.as_str());
        spans.push((m.start(), end));
    }
}

fn extract_months(query: &str, entities: &mut Vec<Entity>, spans: &mut Vec<(usize, usize)>) {
    let bytes = query.as_bytes();
    for m in CJK_MONTH_RE.find_iter(query) {
        if m.start() > 0 && bytes[m.start() - 1].is_ascii_digit() {
            continue;
        }
        let digits = m.as_str().trim_end_matches('月');
        push_entity(entities, EntityKind::Time, digits.trim_start_matches('0'));
        spans.push((m.start(), m.end()));
    }

    for (word, start, end) in english_words(query) {
        if let Some(idx) = ENGLISH_MONTHS.iter().position(|month| *month == word) {
            push_entity(entities, EntityKind::Time, &(idx + 1).to_string());
            spans.push((start, end));
        }
    }
}

fn extract_terms(
    query: &str,
    cjk_terms: &[&str],
    english_terms: &[&str],
    kind: EntityKind,
    entities: &mut Vec<Entity>,
    spans: &mut Vec<(usize, usize)>,
) {
    for term in cjk_terms {
        for (start, matched) in query.match_indices(term) {
            push_entity(entities, kind, term);
            spans.push((start, start + matched.len()));
        }
    }

    for (word, start, end) in english_words(query) {
        if english_terms.contains(&word.as_str()) {
            push_entity(entities, kind, &word);
            spans.push((start, end));
        }
    }
}

/// Lowercased ASCII word runs with their byte spans.
fn english_words(query: &str) -> Vec<(String, usize, usize)> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in query.char_indices() {
        if c.is_ascii_alphabetic() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            words.push((query[s..i].to_lowercase(), s, i));
        }
    }
    if let Some(s) = start {
        words.push((query[s..].to_lowercase(), s, query.len()));
    }
    words
}

fn push_entity(entities: &mut Vec<Entity>, kind: EntityKind, value: &str) {
    if !entities.iter().any(|e| e.kind == kind && e.value == value) {
        entities.push(Entity {
            kind,
            value: value.to_string(),
        });
    }
}

fn strip_spans(query: &str, spans: &mut Vec<(usize, usize)>) -> String {
    spans.sort_unstable();
    let mut out = String::with_capacity(query.len());
    let mut cursor = 0;
    for &(start, end) in spans.iter() {
        if start >= cursor {
            out.push_str(&query[cursor..start]);
            cursor = end;
        } else if end > cursor {
            // Overlapping span, extend the stripped region
            cursor = end;
        }
    }
    out.push_str(&query[cursor..]);

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::Source;

    fn entity_values(intent: &SearchIntent, kind: EntityKind) -> Vec<&str> {
        intent
            .entities
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.value.as_str())
            .collect()
    }

    #[test]
    fn test_mixed_chinese_query() {
        let intent = parse("2023年和妈妈在日本旅游的照片");

        assert_eq!(intent.kind, IntentKind::Mixed);
        assert_eq!(entity_values(&intent, EntityKind::Time), vec!["2023"]);
        assert_eq!(entity_values(&intent, EntityKind::Person), vec!["妈妈"]);
        assert_eq!(entity_values(&intent, EntityKind::Location), vec!["日本"]);
        assert!(!intent.refined_query.contains("2023"));
        assert!(!intent.refined_query.contains("妈妈"));
        assert!(!intent.refined_query.contains("日本"));
        assert!(!intent.fallback_used);
    }

    #[test]
    fn test_mixed_english_query() {
        let intent = parse("photos with grandma at the beach in 2019");

        assert_eq!(intent.kind, IntentKind::Mixed);
        assert_eq!(entity_values(&intent, EntityKind::Time), vec!["2019"]);
        assert_eq!(entity_values(&intent, EntityKind::Person), vec!["grandma"]);
        assert_eq!(entity_values(&intent, EntityKind::Location), vec!["beach"]);
        assert_eq!(intent.refined_query, "photos with at the in");
    }

    #[test]
    fn test_emotion_only_is_semantic() {
        let intent = parse("happy moments");

        assert_eq!(intent.kind, IntentKind::Semantic);
        assert_eq!(entity_values(&intent, EntityKind::Emotion), vec!["happy"]);
        // Emotion words are not stripped: they drive the semantic query
        assert_eq!(intent.refined_query, "happy moments");
    }

    #[test]
    fn test_emotion_with_entity_is_mixed() {
        let intent = parse("开心的日本旅行");

        assert_eq!(intent.kind, IntentKind::Mixed);
        assert_eq!(entity_values(&intent, EntityKind::Location), vec!["日本"]);
        assert_eq!(entity_values(&intent, EntityKind::Emotion), vec!["开心"]);
    }

    #[test]
    fn test_plain_query_is_keyword() {
        let intent = parse("sunset silhouette");

        assert_eq!(intent.kind, IntentKind::Keyword);
        assert!(intent.entities.is_empty());
        assert_eq!(intent.refined_query, "sunset silhouette");
        assert_eq!(intent.search_hints, vec![Source::Keyword, Source::Semantic]);
    }

    #[test]
    fn test_person_entity_enables_people_strategy() {
        let intent = parse("爸爸的照片");
        assert_eq!(
            intent.search_hints,
            vec![Source::People, Source::Keyword, Source::Semantic]
        );
    }

    #[test]
    fn test_cjk_month() {
        let intent = parse("3月的樱花");
        assert_eq!(entity_values(&intent, EntityKind::Time), vec!["3"]);
        assert!(!intent.refined_query.contains("3月"));
    }

    #[test]
    fn test_english_month() {
        let intent = parse("pictures from march");
        assert_eq!(entity_values(&intent, EntityKind::Time), vec!["3"]);
    }

    #[test]
    fn test_year_and_month_together() {
        let intent = parse("2021年12月");
        let times = entity_values(&intent, EntityKind::Time);
        assert!(times.contains(&"2021"));
        assert!(times.contains(&"12"));
    }

    #[test]
    fn test_year_not_matched_inside_digit_runs() {
        let intent = parse("IMG20233 and 120234");
        assert!(entity_values(&intent, EntityKind::Time).is_empty());
        assert_eq!(intent.kind, IntentKind::Keyword);
    }

    #[test]
    fn test_repeated_terms_dedupe() {
        let intent = parse("妈妈和妈妈的妈妈");
        assert_eq!(entity_values(&intent, EntityKind::Person), vec!["妈妈"]);
    }

    #[test]
    fn test_refined_query_falls_back_to_original() {
        let intent = parse("2023年");
        assert_eq!(intent.refined_query, "2023年");
    }

    #[test]
    fn test_strip_terms() {
        let refined = strip_terms("tokyo at night", ["tokyo"].into_iter());
        assert_eq!(refined, "at night");

        // Stripping everything returns the original
        let refined = strip_terms("日本", ["日本"].into_iter());
        assert_eq!(refined, "日本");
    }
}
