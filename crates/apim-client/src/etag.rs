//! Version tags and the `If-Match` precondition

use std::fmt;

/// Precondition sent with a mutating request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IfMatch {
    /// Apply only if the remote record still carries this (quoted) tag
    Tag(String),
    /// Apply unconditionally (`*`)
    Any,
}

impl IfMatch {
    /// Header value
    pub fn header_value(&self) -> &str {
        match self {
            IfMatch::Tag(tag) => tag,
            IfMatch::Any => "*",
        }
    }
}

impl fmt::Display for IfMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header_value())
    }
}

/// Normalize an `ETag` header into the quoted form `If-Match` expects.
///
/// Strips a weak `W/` prefix and any quotes, trims, and re-quotes.
/// Returns `None` when nothing is left.
pub fn normalize_etag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unweakened = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    let bare = unweakened.trim_matches('"').trim();
    if bare.is_empty() {
        None
    } else {
        Some(format!("\"{bare}\""))
    }
}
