//! FITS-style header keywords attached to an image.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value of a header keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeywordValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl fmt::Display for KeywordValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeywordValue::Str(s) => write!(f, "{s}"),
            KeywordValue::Int(i) => write!(f, "{i}"),
            KeywordValue::Float(x) => write!(f, "{x}"),
        }
    }
}

impl From<&str> for KeywordValue {
    fn from(value: &str) -> Self {
        KeywordValue::Str(value.to_string())
    }
}

impl From<String> for KeywordValue {
    fn from(value: String) -> Self {
        KeywordValue::Str(value)
    }
}

impl From<i64> for KeywordValue {
    fn from(value: i64) -> Self {
        KeywordValue::Int(value)
    }
}

impl From<f64> for KeywordValue {
    fn from(value: f64) -> Self {
        KeywordValue::Float(value)
    }
}

/// A single header card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub name: String,
    pub value: KeywordValue,
    pub comment: String,
}

/// Ordered keyword list. Names are stored upper-case and are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    keywords: Vec<Keyword>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a keyword, replacing any existing value in place.
    pub fn set(&mut self, name: &str, value: impl Into<KeywordValue>, comment: &str) {
        let name = name.to_ascii_uppercase();
        let keyword = Keyword {
            name: name.clone(),
            value: value.into(),
            comment: comment.to_string(),
        };
        match self.keywords.iter_mut().find(|k| k.name == name) {
            Some(existing) => *existing = keyword,
            None => self.keywords.push(keyword),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Keyword> {
        let name = name.to_ascii_uppercase();
        self.keywords.iter().find(|k| k.name == name)
    }

    /// Remove a keyword; returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.to_ascii_uppercase();
        let before = self.keywords.len();
        self.keywords.retain(|k| k.name != name);
        before != self.keywords.len()
    }

    pub fn clear(&mut self) {
        self.keywords.clear();
    }

    /// Copy every keyword of `other` into this header.
    pub fn merge(&mut self, other: &Header) {
        for keyword in &other.keywords {
            self.set(&keyword.name, keyword.value.clone(), &keyword.comment);
        }
    }

    pub fn extend(&mut self, keywords: impl IntoIterator<Item = Keyword>) {
        for keyword in keywords {
            self.set(&keyword.name, keyword.value, &keyword.comment);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Keyword> {
        self.keywords.iter()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut header = Header::new();
        header.set("object", "M31", "");
        header.set("EXPTIME", 2.0, "Exposure time (seconds)");
        header.set("OBJECT", "M33", "target");

        assert_eq!(header.len(), 2);
        let first = header.iter().next().unwrap();
        assert_eq!(first.name, "OBJECT");
        assert_eq!(first.value, KeywordValue::Str("M33".to_string()));
    }

    #[test]
    fn test_remove_and_merge() {
        let mut header = Header::new();
        header.set("COMPLAMP", "HeAr", "Comp lamp names");
        assert!(header.remove("complamp"));
        assert!(!header.remove("COMPLAMP"));

        let mut other = Header::new();
        other.set("CCDTEMP", -135.2, "");
        header.merge(&other);
        assert_eq!(
            header.get("ccdtemp").unwrap().value,
            KeywordValue::Float(-135.2)
        );
    }
}
