//! Semicolon-delimited `k=v;` packet headers.
//!
//! The encoding is a protocol legacy: keys and values are not escaped, so
//! `;` and `=` inside values are not supported. Parsing is lenient: a
//! segment with no `=` is ignored, and a segment may carry an empty value.

use bytes::Bytes;

/// An ordered key/value header map with replace-on-set semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses header bytes. Segments without `=` are skipped.
    pub fn parse(data: &[u8]) -> Self {
        let mut map = Self::new();
        for segment in String::from_utf8_lossy(data).split(';') {
            if let Some((key, value)) = segment.split_once('=') {
                if !key.is_empty() {
                    map.set(key, value);
                }
            }
        }
        map
    }

    /// Sets a property, replacing any prior segment for the key.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serializes as the concatenation of `k=v;` segments.
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push(';');
        }
        Bytes::from(out)
    }
}
