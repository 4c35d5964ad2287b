//! Backend-agnostic key/value trait.

use async_trait::async_trait;

use crate::error::StoreError;

/// An ordered key/value store.
///
/// A single `put` or `delete` is the only atomic unit the backend offers.
/// `list` returns entries sorted ascending by key, which the queue layer
/// relies on for priority-then-arrival ordering.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the value for a key, if present.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite a key.
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List all entries whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

/// Escape a caller-supplied string for use as one `:`-delimited key segment.
///
/// Without this, a project key containing `:` would make one project's scan
/// prefix match another project's entries.
pub(crate) fn escape_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3a"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_escaping_keeps_delimiters_unambiguous() {
        assert_eq!(escape_segment("plain"), "plain");
        assert_eq!(escape_segment("a:b"), "a%3ab");
        assert_eq!(escape_segment("a%3ab"), "a%253ab");
        // Distinct inputs never collide after escaping.
        assert_ne!(escape_segment("a:b"), escape_segment("a%3ab"));
    }
}
