//! Fuzzy person-name retrieval over the tagged-photo graph.

use crate::persons::{Person, PersonStore};
use crate::photos::{Photo, PhotoStore};
use chrono::Datelike;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

pub const EXACT_MATCH_SCORE: f32 = 1.0;
pub const PREFIX_MATCH_SCORE: f32 = 0.9;
pub const SUBSTRING_MATCH_SCORE: f32 = 0.7;

#[derive(Debug, Clone, Serialize)]
pub struct PersonMatch {
    pub person: Person,
    pub score: f32,
    pub face_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopularPerson {
    pub person: Person,
    pub photo_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PersonPhotosOptions {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Tiered name match: exact beats prefix beats substring,
/// case-insensitive throughout.
fn match_score(candidate: &str, query: &str) -> Option<f32> {
    let candidate = candidate.to_lowercase();
    let query = query.to_lowercase();

    if candidate == query {
        Some(EXACT_MATCH_SCORE)
    } else if candidate.starts_with(&query) {
        Some(PREFIX_MATCH_SCORE)
    } else if candidate.contains(&query) {
        Some(SUBSTRING_MATCH_SCORE)
    } else {
        None
    }
}

pub struct PersonLookup {
    persons: Arc<dyn PersonStore>,
    photos: Arc<dyn PhotoStore>,
}

impl PersonLookup {
    pub fn new(persons: Arc<dyn PersonStore>, photos: Arc<dyn PhotoStore>) -> Self {
        Self { persons, photos }
    }

    /// Ranked person matches for a free-text name query.
    pub fn search(&self, query: &str) -> anyhow::Result<Vec<PersonMatch>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(vec![]);
        }

        let mut matches = vec![];
        for person in self.persons.all_persons()? {
            let best = person
                .known_names()
                .iter()
                .filter_map(|name| match_score(name, query))
                .fold(None::<f32>, |acc, score| {
                    Some(acc.map_or(score, |a| a.max(score)))
                });

            if let Some(score) = best {
                let face_count = self.persons.faces_for_person(person.id)?.len();
                matches.push(PersonMatch {
                    person,
                    score,
                    face_count,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.person.id.cmp(&b.person.id))
        });

        Ok(matches)
    }

    /// Photos a person is tagged in, newest capture first. Photos
    /// without a capture date sort last.
    pub fn get_photos(
        &self,
        person_id: u64,
        options: &PersonPhotosOptions,
    ) -> anyhow::Result<Vec<Photo>> {
        let ids: HashSet<u64> = self
            .persons
            .photo_ids_for_person(person_id)?
            .into_iter()
            .collect();

        let mut photos: Vec<Photo> = self
            .photos
            .all()?
            .into_iter()
            .filter(|p| ids.contains(&p.id))
            .filter(|p| {
                options
                    .year
                    .map_or(true, |year| p.taken_at.map(|d| d.year()) == Some(year))
            })
            .filter(|p| {
                options
                    .month
                    .map_or(true, |month| p.taken_at.map(|d| d.month()) == Some(month))
            })
            .collect();

        photos.sort_by(|a, b| b.taken_at.cmp(&a.taken_at).then_with(|| a.id.cmp(&b.id)));

        Ok(photos
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Autocomplete: persons whose names start with the prefix, most
    /// tagged first.
    pub fn get_suggestions(&self, prefix: &str, limit: usize) -> anyhow::Result<Vec<PersonMatch>> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Ok(vec![]);
        }

        let mut matches = vec![];
        for person in self.persons.all_persons()? {
            let hit = person
                .known_names()
                .iter()
                .any(|name| name.to_lowercase().starts_with(&prefix));

            if hit {
                let face_count = self.persons.faces_for_person(person.id)?.len();
                matches.push(PersonMatch {
                    person,
                    score: PREFIX_MATCH_SCORE,
                    face_count,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.face_count
                .cmp(&a.face_count)
                .then_with(|| a.person.name.cmp(&b.person.name))
        });
        matches.truncate(limit);

        Ok(matches)
    }

    /// Persons ranked by how many photos they are tagged in.
    pub fn get_popular(&self, limit: usize) -> anyhow::Result<Vec<PopularPerson>> {
        let mut popular = vec![];
        for person in self.persons.all_persons()? {
            let photo_count = self.persons.photo_ids_for_person(person.id)?.len();
            if photo_count > 0 {
                popular.push(PopularPerson {
                    person,
                    photo_count,
                });
            }
        }

        popular.sort_by(|a, b| {
            b.photo_count
                .cmp(&a.photo_count)
                .then_with(|| a.person.name.cmp(&b.person.name))
        });
        popular.truncate(limit);

        Ok(popular)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_score_exact() {
        assert_eq!(match_score("Alice", "alice"), Some(EXACT_MATCH_SCORE));
    }

    #[test]
    fn test_match_score_prefix() {
        assert_eq!(match_score("Alexandra", "alex"), Some(PREFIX_MATCH_SCORE));
    }

    #[test]
    fn test_match_score_substring() {
        assert_eq!(match_score("Mary-Anne", "anne"), Some(SUBSTRING_MATCH_SCORE));
    }

    #[test]
    fn test_match_score_miss() {
        assert_eq!(match_score("Alice", "bob"), None);
    }

    #[test]
    fn test_match_score_cjk() {
        assert_eq!(match_score("妈妈", "妈妈"), Some(EXACT_MATCH_SCORE));
    }
}
