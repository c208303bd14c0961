//! Content preprocessing for embedding generation.
//!
//! Extracted text is noisy (tag-stripped HTML is mostly whitespace), so
//! before embedding:
//! 1. Collapse whitespace runs into single spaces
//! 2. Skip if empty
//! 3. Truncate to max length with ellipsis

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Normalize and bound text for the embedding model.
///
/// Returns `None` if nothing but whitespace remains.
pub fn prepare_for_embedding(text: &str, max_chars: usize) -> Option<String> {
    let content = collapse_whitespace(text);
    if content.is_empty() {
        return None;
    }
    Some(truncate_content(&content, max_chars))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate content to `max_chars` characters, adding ellipsis if truncated.
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }

    // count chars, not bytes, so UTF-8 sequences are never split
    let keep = max_chars.saturating_sub(TRUNCATION_SUFFIX.len());
    let truncated: String = content.chars().take(keep).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}
