use serde::{Deserialize, Serialize};
use std::fmt;

/// Version numbers grow with recency: the newest stored copy has the largest number.
pub type VersionNumber = u32;

/// Identifier of one logical resource (usually a URL) inside a resource tree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        ResourceId(s)
    }
}

/// A digest previously recorded for one stored version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDigest {
    /// Algorithm name as recorded at hashing time (e.g. "SHA-1")
    pub algorithm: String,
    /// Raw digest bytes, serialized as lowercase hex
    #[serde(with = "hex::serde")]
    pub digest: Vec<u8>,
}

impl StoredDigest {
    pub fn new(algorithm: impl Into<String>, digest: impl Into<Vec<u8>>) -> Self {
        StoredDigest {
            algorithm: algorithm.into(),
            digest: digest.into(),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// Store-reported metadata for one version of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub number: VersionNumber,
    /// Size of the stored content in bytes (0 when there is no content)
    pub size: u64,
    /// False when the version's metadata survives but its content does not
    pub has_content: bool,
    #[serde(default)]
    pub stored_digest: Option<StoredDigest>,
    /// Set once a local verification has found the content corrupt
    #[serde(default)]
    pub suspect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_digest_serializes_as_hex() {
        let d = StoredDigest::new("SHA-1", vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, r#"{"algorithm":"SHA-1","digest":"deadbeef"}"#);

        let back: StoredDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.to_hex(), "deadbeef");
    }

    #[test]
    fn resource_ids_order_lexically() {
        let mut ids = vec![ResourceId::from("http://b/"), ResourceId::from("http://a/x")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "http://a/x");
        assert_eq!(ids[1].to_string(), "http://b/");
    }
}
