//! HTTP header collection with case-insensitive lookups.

use super::MAX_HEADERS;

/// HTTP headers stored in insertion order.
///
/// Lookups are case-insensitive; the same name may appear multiple times.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection.
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Append a header. Existing headers with the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers.len() >= MAX_HEADERS {
            return;
        }
        self.headers.push((name.into(), value.into()));
    }

    /// Replace all values of a header with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.insert(name.to_string(), value);
    }

    /// Get the first value for a header (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check if a header exists.
    pub fn contains(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all instances of a header (case-insensitive). Returns how many
    /// were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.headers.len()
    }

    /// Iterate over all headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Parse the Content-Length header, if present and well-formed.
    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length").and_then(|v| v.trim().parse().ok())
    }
}
