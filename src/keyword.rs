//! Inverted-index keyword search over photo text fields.
//!
//! Tokens map to photo id sets per field. The index is maintained
//! incrementally: photos are added and removed one at a time, never via
//! a full rebuild.

use crate::photos::Photo;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    FileName,
    Title,
    Description,
    Tags,
}

pub const ALL_FIELDS: [TextField; 4] = [
    TextField::FileName,
    TextField::Title,
    TextField::Description,
    TextField::Tags,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    And,
    #[default]
    Or,
}

#[derive(Debug, Clone, Default)]
pub struct KeywordSearchOptions {
    /// Fields searched; `None` means all of them.
    pub fields: Option<Vec<TextField>>,
    pub mode: MatchMode,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub photo_id: u64,
    /// Fraction of query tokens matched, in `(0, 1]`.
    pub score: f32,
    pub matched_tokens: usize,
    pub total_tokens: usize,
}

/// Split text into lowercase tokens. Punctuation separates tokens;
/// consecutive CJK characters stay together as one token.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut current = String::new();
    let mut current_is_cjk = false;

    for ch in text.chars() {
        if ch.is_alphanumeric() {
            let cjk = is_cjk(ch);
            if !current.is_empty() && cjk != current_is_cjk {
                tokens.push(std::mem::take(&mut current));
            }
            current_is_cjk = cjk;
            for lc in ch.to_lowercase() {
                current.push(lc);
            }
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// CJK unified ideographs (+ extension A and compatibility blocks),
/// kana and hangul.
fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0x3040..=0x30FF | 0xAC00..=0xD7AF
    )
}

#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    /// field -> token -> photo ids
    postings: HashMap<TextField, HashMap<String, HashSet<u64>>>,
    /// photo id -> indexed tokens per field, kept for removal
    docs: HashMap<u64, Vec<(TextField, String)>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, photo_id: u64) -> bool {
        self.docs.contains_key(&photo_id)
    }

    /// Index a photo's text fields. Re-adding an already indexed photo
    /// replaces its previous entries.
    pub fn add_photo(&mut self, photo: &Photo) {
        if self.docs.contains_key(&photo.id) {
            self.remove_photo(photo.id);
        }

        let mut entries = vec![];
        let field_texts: [(TextField, String); 4] = [
            (TextField::FileName, photo.file_name.clone()),
            (TextField::Title, photo.title.clone()),
            (TextField::Description, photo.description.clone()),
            (TextField::Tags, photo.tags.join(" ")),
        ];

        for (field, text) in field_texts {
            for token in tokenize(&text) {
                self.postings
                    .entry(field)
                    .or_default()
                    .entry(token.clone())
                    .or_default()
                    .insert(photo.id);
                entries.push((field, token));
            }
        }

        self.docs.insert(photo.id, entries);
    }

    pub fn remove_photo(&mut self, photo_id: u64) {
        let Some(entries) = self.docs.remove(&photo_id) else {
            return;
        };

        for (field, token) in entries {
            let Some(tokens) = self.postings.get_mut(&field) else {
                continue;
            };
            if let Some(ids) = tokens.get_mut(&token) {
                ids.remove(&photo_id);
                if ids.is_empty() {
                    tokens.remove(&token);
                }
            }
        }
    }

    pub fn search(&self, query: &str, options: &KeywordSearchOptions) -> Vec<KeywordHit> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return vec![];
        }

        let fields: Vec<TextField> = options
            .fields
            .clone()
            .unwrap_or_else(|| ALL_FIELDS.to_vec());

        // Photo ids per query token, unioned across the selected fields.
        let per_token: Vec<HashSet<u64>> = query_tokens
            .iter()
            .map(|token| {
                let mut ids = HashSet::new();
                for field in &fields {
                    if let Some(posting) = self.postings.get(field).and_then(|t| t.get(token)) {
                        ids.extend(posting.iter().copied());
                    }
                }
                ids
            })
            .collect();

        let total_tokens = query_tokens.len();

        let mut hits: Vec<KeywordHit> = match options.mode {
            MatchMode::And => {
                let mut iter = per_token.iter();
                let first = iter.next().cloned().unwrap_or_default();
                let matched: HashSet<u64> = iter.fold(first, |acc, ids| {
                    acc.intersection(ids).copied().collect()
                });

                matched
                    .into_iter()
                    .map(|photo_id| KeywordHit {
                        photo_id,
                        score: 1.0,
                        matched_tokens: total_tokens,
                        total_tokens,
                    })
                    .collect()
            }
            MatchMode::Or => {
                let mut counts: HashMap<u64, usize> = HashMap::new();
                for ids in &per_token {
                    for id in ids {
                        *counts.entry(*id).or_insert(0) += 1;
                    }
                }

                counts
                    .into_iter()
                    .map(|(photo_id, matched)| KeywordHit {
                        photo_id,
                        score: matched as f32 / total_tokens as f32,
                        matched_tokens: matched,
                        total_tokens,
                    })
                    .collect()
            }
        };

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.photo_id.cmp(&b.photo_id))
        });

        if let Some(limit) = options.limit {
            hits.truncate(limit);
        }

        hits
    }
}
