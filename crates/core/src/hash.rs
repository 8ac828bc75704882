//! Content digests for change detection
//!
//! Digests depend on file bytes only, never on path or mtime, so the same
//! content hashes identically wherever it is staged. Manifests store the full
//! 64-character hex form; logs show the first 16 characters.

use std::fmt;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hex characters shown by `Display` and `Debug`
const SHORT_LEN: usize = 16;

/// BLAKE3 digest of a file's content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }

    /// Digest of the file at `path`, streamed
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or read
    pub fn from_file(path: &Path) -> color_eyre::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(file)?;
        Ok(Self(hasher.finalize().into()))
    }

    /// Parse the manifest form
    ///
    /// # Errors
    /// Returns an error unless `s` is exactly 32 hex-encoded bytes
    pub fn from_hex(s: &str) -> color_eyre::Result<Self> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(s, &mut digest)?;
        Ok(Self(digest))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(SHORT_LEN);
        hex
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&self.short()).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text)
            .map_err(|e| D::Error::custom(format!("invalid content hash {text:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_content_equal_hash() {
        assert_eq!(
            ContentHash::from_bytes(b"wood grain"),
            ContentHash::from_bytes(b"wood grain")
        );
        assert_ne!(
            ContentHash::from_bytes(b"wood grain"),
            ContentHash::from_bytes(b"oak")
        );
    }

    #[test]
    fn test_file_hash_ignores_location() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("nested").join("b.png");
        std::fs::create_dir_all(b.parent().unwrap()).unwrap();
        std::fs::write(&a, b"pixels").unwrap();
        std::fs::write(&b, b"pixels").unwrap();

        let ha = ContentHash::from_file(&a).unwrap();
        assert_eq!(ha, ContentHash::from_file(&b).unwrap());
        assert_eq!(ha, ContentHash::from_bytes(b"pixels"));
    }

    #[test]
    fn test_display_is_short_prefix() {
        let hash = ContentHash::from_bytes(b"texture");
        assert_eq!(hash.to_string().len(), SHORT_LEN);
        assert!(hash.to_hex().starts_with(&hash.to_string()));
    }

    #[test]
    fn test_hex_serde() {
        let hash = ContentHash::from_bytes(b"texture");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);

        assert!(serde_json::from_str::<ContentHash>("\"abc\"").is_err());
    }
}
