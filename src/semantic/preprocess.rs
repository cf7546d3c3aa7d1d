//! Caption preprocessing for embedding generation.
//!
//! Trims the photo title, description and tags, joins them with
//! separators, and truncates the result with an ellipsis. Photos with
//! no describable text yield no caption at all.

/// Maximum caption length for embedding input (characters, not tokens)
const MAX_CAPTION_LENGTH: usize = 512;

/// Ellipsis suffix when a caption is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Preprocess photo text for embedding generation.
///
/// Returns `None` if title, description and tags are all empty after
/// trimming. Otherwise, concatenates them and truncates to
/// `MAX_CAPTION_LENGTH`.
pub fn preprocess_caption(title: &str, description: &str, tags: &[String]) -> Option<String> {
    let title = title.trim();
    let description = description.trim();
    let tags = tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() && description.is_empty() && tags.is_empty() {
        return None;
    }

    let mut parts = vec![];
    if !title.is_empty() {
        parts.push(title.to_string());
    }
    if !description.is_empty() {
        parts.push(description.to_string());
    }
    let mut caption = parts.join(" - ");
    if !tags.is_empty() {
        if caption.is_empty() {
            caption = tags;
        } else {
            caption = format!("{} ({})", caption, tags);
        }
    }

    Some(truncate_caption(&caption))
}

/// Truncate a caption to MAX_CAPTION_LENGTH, adding ellipsis if truncated.
fn truncate_caption(caption: &str) -> String {
    if caption.len() <= MAX_CAPTION_LENGTH {
        return caption.to_string();
    }

    // Cut on a char boundary, never mid-sequence
    let max_chars = MAX_CAPTION_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = caption.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Compute a hash of the describable content for change detection.
/// Used to determine if a photo needs re-embedding.
pub fn caption_hash(title: &str, description: &str, tags: &[String]) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    title.trim().hash(&mut hasher);
    description.trim().hash(&mut hasher);
    for tag in tags {
        tag.trim().hash(&mut hasher);
    }
    hasher.finish()
}
