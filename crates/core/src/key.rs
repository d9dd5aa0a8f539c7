//! Key type and validation.
//!
//! Keys are immutable byte strings (spec §3), not necessarily UTF-8 — the
//! engine never inspects key contents beyond hashing and length, so `Key`
//! wraps an `Arc<[u8]>` for cheap cloning across shards, caches, and the
//! entanglement index.

use crate::limits::Limits;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// An immutable, cheaply-cloneable key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<[u8]>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(Arc::from(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::new(s.into_bytes())
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key::new(b.to_vec())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Key({s:?})"),
            Err(_) => write!(f, "Key({:?})", self.0),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{}", hex_preview(&self.0)),
        }
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

/// Key validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key cannot be empty")]
    Empty,

    #[error("key too long: {actual} bytes exceeds maximum {max}")]
    TooLong { actual: usize, max: usize },
}

/// Validate a key against the default limits.
pub fn validate_key(key: &Key) -> Result<(), KeyError> {
    validate_key_with_limits(key, &Limits::default())
}

/// Validate a key against caller-supplied limits (the engine's frozen
/// open-time configuration).
pub fn validate_key_with_limits(key: &Key, limits: &Limits) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    if key.len() > limits.max_key_bytes {
        return Err(KeyError::TooLong {
            actual: key.len(),
            max: limits.max_key_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys_pass() {
        assert!(validate_key(&Key::from("mykey")).is_ok());
        assert!(validate_key(&Key::from("日本語キー")).is_ok());
    }

    #[test]
    fn empty_key_rejected() {
        assert_eq!(validate_key(&Key::from("")), Err(KeyError::Empty));
    }

    #[test]
    fn too_long_key_rejected() {
        let limits = Limits {
            max_key_bytes: 4,
            ..Limits::default()
        };
        let key = Key::from("toolong");
        assert_eq!(
            validate_key_with_limits(&key, &limits),
            Err(KeyError::TooLong { actual: 7, max: 4 })
        );
    }

    #[test]
    fn key_at_exact_limit_is_ok() {
        let limits = Limits {
            max_key_bytes: 5,
            ..Limits::default()
        };
        let key = Key::from("exact");
        assert!(validate_key_with_limits(&key, &limits).is_ok());
    }

    #[test]
    fn binary_keys_are_supported() {
        let key = Key::from(&[0xffu8, 0x00, 0x01][..]);
        assert_eq!(key.len(), 3);
        assert!(validate_key(&key).is_ok());
    }
}
