use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Length in bytes of a plugin's long-term key.
pub const KEY_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("key is not valid base64: {0}")]
    InvalidEncoding(String),
}

/// Long-term key identifying a plugin.
///
/// The durable store owns the canonical record; everything else treats the
/// key as an opaque lookup token. Rendered as standard base64.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PluginKey([u8; KEY_LEN]);

impl PluginKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyParseError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyParseError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Short prefix for log lines.
    pub fn fingerprint(&self) -> String {
        let mut s = self.to_base64();
        s.truncate(8);
        s
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginKey({}..)", self.fingerprint())
    }
}

impl FromStr for PluginKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| KeyParseError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(PluginKey::generate(), PluginKey::generate());
    }

    #[test]
    fn base64_roundtrip() {
        let key = PluginKey::generate();
        let parsed: PluginKey = key.to_string().parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert_eq!(
            PluginKey::from_slice(&[0u8; 31]),
            Err(KeyParseError::InvalidLength(31))
        );
        assert!(PluginKey::from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "not base64 !!".parse::<PluginKey>().unwrap_err();
        assert!(matches!(err, KeyParseError::InvalidEncoding(_)));
    }

    #[test]
    fn debug_shows_fingerprint_only() {
        let key = PluginKey::from_bytes([1u8; KEY_LEN]);
        let debug = format!("{key:?}");
        assert!(debug.starts_with("PluginKey("));
        assert!(!debug.contains(&key.to_base64()));
    }
}
