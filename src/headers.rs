//! Case-insensitive header storage shared by [`Request`](crate::request::Request).
//!
//! Lookup keys are normalized to lowercase once, on insert, so `getHeader`
//! is a single hash lookup regardless of how the client cased the name.

use std::collections::HashMap;

#[inline(always)]
fn is_set_cookie(val: &str) -> bool {
    val.eq_ignore_ascii_case("set-cookie")
}

/// A case-insensitive `name -> value` header map.
///
/// Multiple occurrences of the same header are joined with `", "`, except
/// `Set-Cookie` (forbidden in requests; joining it with commas would corrupt
/// `Expires=` attributes, so the first occurrence wins instead).
#[derive(Debug, Default, Clone)]
pub struct HeaderMap {
    entries: HashMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap { entries: HashMap::new() }
    }

    /// Insert a raw `(name, value)` pair as read off the wire.
    pub fn insert(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        if is_set_cookie(&key) {
            self.entries.entry(key).or_insert_with(|| value.to_string());
            return;
        }
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.entries.insert(key, value.to_string());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn is_transfer_encoding_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length_raw(&self) -> Option<&str> {
        self.get("content-length")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
