//! TXT records: key/value metadata advertised alongside a service.
//!
//! The byte encoding follows DNS-SD: a sequence of entries, each a one-byte
//! length followed by `key=value` in UTF-8. An empty set encodes as a single
//! zero byte. Decoding never fails; a malformed blob yields an empty set.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded size of one `key=value` entry.
pub const MAX_ENTRY_LEN: usize = 255;

/// Errors raised while encoding a TXT record set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxtRecordError {
    #[error("TXT record key is empty")]
    EmptyKey,
    #[error("TXT record key contains '=': {0}")]
    InvalidKey(String),
    #[error("TXT record entry for '{key}' is {len} bytes (max {MAX_ENTRY_LEN})")]
    EntryTooLong { key: String, len: usize },
}

/// Ordered string map with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtRecordSet {
    entries: Vec<(String, String)>,
}

impl TxtRecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value. A replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut existing.1, value));
        }
        self.entries.push((key, value));
        None
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

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode to the DNS-SD TXT wire format.
    pub fn encode(&self) -> Result<Vec<u8>, TxtRecordError> {
        if self.entries.is_empty() {
            return Ok(vec![0]);
        }
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            if key.is_empty() {
                return Err(TxtRecordError::EmptyKey);
            }
            if key.contains('=') {
                return Err(TxtRecordError::InvalidKey(key.clone()));
            }
            let len = key.len() + 1 + value.len();
            if len > MAX_ENTRY_LEN {
                return Err(TxtRecordError::EntryTooLong {
                    key: key.clone(),
                    len,
                });
            }
            out.push(len as u8);
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        }
        Ok(out)
    }

    /// Decode the DNS-SD TXT wire format. Malformed input yields an empty set.
    pub fn decode(bytes: &[u8]) -> Self {
        Self::try_decode(bytes).unwrap_or_default()
    }

    fn try_decode(bytes: &[u8]) -> Option<Self> {
        let mut set = Self::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let len = bytes[pos] as usize;
            pos += 1;
            if len == 0 {
                continue;
            }
            let entry = bytes.get(pos..pos + len)?;
            pos += len;
            let entry = std::str::from_utf8(entry).ok()?;
            let (key, value) = match entry.split_once('=') {
                Some((k, v)) => (k, v),
                None => (entry, ""),
            };
            // Entries without a key are ignored, and only the first
            // occurrence of a key counts.
            if key.is_empty() || set.contains_key(key) {
                continue;
            }
            set.entries.push((key.to_string(), value.to_string()));
        }
        Some(set)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TxtRecordSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

impl IntoIterator for TxtRecordSet {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Converts TXT record sets to and from the bytes a discovery transport carries.
pub trait TxtRecordCodec: Send + Sync + 'static {
    fn encode(&self, records: &TxtRecordSet) -> Result<Vec<u8>, TxtRecordError>;

    /// Must not fail: malformed input yields an empty set.
    fn decode(&self, bytes: &[u8]) -> TxtRecordSet;
}

/// The DNS-SD TXT encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsTxtCodec;

impl TxtRecordCodec for DnsTxtCodec {
    fn encode(&self, records: &TxtRecordSet) -> Result<Vec<u8>, TxtRecordError> {
        records.encode()
    }

    fn decode(&self, bytes: &[u8]) -> TxtRecordSet {
        TxtRecordSet::decode(bytes)
    }
}
