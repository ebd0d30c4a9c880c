//! Shared utility functions used across multiple modules.

use std::hash::{Hash, Hasher};

/// Longest text kept by [`compact_text`], in characters.
pub const MAX_COMPACT_CHARS: usize = 180;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most [`MAX_COMPACT_CHARS`] characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(MAX_COMPACT_CHARS).collect()
}

/// Stable-per-process hash of a caller identity for log fields.
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}
