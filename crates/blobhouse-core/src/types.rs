//! Core data model: content hashes, URIs, transform chains and blob metadata.

use crate::error::{VaultError, VaultResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum bucket name length in bytes.
pub const MAX_BUCKET_LEN: usize = 255;
/// Maximum object key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// A 32-byte BLAKE3 digest of a blob's original (untransformed) content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Lowercase hex form, as used in URIs and the SQL index.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex digest.
    pub fn from_hex(s: &str) -> VaultResult<Self> {
        let raw = hex::decode(s)
            .map_err(|e| VaultError::ValidationFailure(format!("invalid content hash: {e}")))?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| {
            VaultError::ValidationFailure("content hash must be 32 bytes".to_string())
        })?;
        Ok(ContentHash(bytes))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Location of physical bytes: `<scheme>://<backend-specific-locator>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobUri {
    scheme: String,
    locator: String,
}

impl BlobUri {
    /// Build a URI from its parts. Scheme must be lowercase alphanumeric (plus `+-.`).
    pub fn new(scheme: impl Into<String>, locator: impl Into<String>) -> VaultResult<Self> {
        let scheme = scheme.into();
        let locator = locator.into();
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c))
        {
            return Err(VaultError::ValidationFailure(format!(
                "invalid uri scheme '{scheme}'"
            )));
        }
        if locator.is_empty() {
            return Err(VaultError::ValidationFailure(
                "uri locator must not be empty".to_string(),
            ));
        }
        Ok(Self { scheme, locator })
    }

    /// Scheme part, used to select the storage provider.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Backend-specific locator.
    pub fn locator(&self) -> &str {
        &self.locator
    }
}

impl fmt::Display for BlobUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.locator)
    }
}

impl FromStr for BlobUri {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, locator) = s
            .split_once("://")
            .ok_or_else(|| VaultError::ValidationFailure(format!("uri '{s}' has no scheme")))?;
        BlobUri::new(scheme, locator)
    }
}

impl TryFrom<String> for BlobUri {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlobUri> for String {
    fn from(uri: BlobUri) -> Self {
        uri.to_string()
    }
}

/// Caller-declared policy hint used to pick a transform chain and a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageIntent {
    /// Long-lived data: compressed and encrypted on a durable backend.
    #[default]
    Durable,
    /// Short-lived, fast access: light compression, no encryption.
    Cache,
    /// Cold data: maximum compression, encrypted.
    Archival,
}

impl StorageIntent {
    /// All intents, in declaration order.
    pub const ALL: [StorageIntent; 3] = [
        StorageIntent::Durable,
        StorageIntent::Cache,
        StorageIntent::Archival,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageIntent::Durable => "durable",
            StorageIntent::Cache => "cache",
            StorageIntent::Archival => "archival",
        }
    }
}

impl fmt::Display for StorageIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageIntent {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "durable" => Ok(StorageIntent::Durable),
            "cache" => Ok(StorageIntent::Cache),
            "archival" => Ok(StorageIntent::Archival),
            other => Err(VaultError::ValidationFailure(format!(
                "unknown storage intent '{other}'"
            ))),
        }
    }
}

/// Arguments of one transform step. Ordered so the encoded chain is stable.
pub type TransformArgs = BTreeMap<String, String>;

/// Argument carrying the key id an encryption step was applied with.
pub const ARG_KEY_ID: &str = "key_id";
/// Argument carrying the key generation an encryption step was applied with.
pub const ARG_KEY_GENERATION: &str = "key_generation";

/// One step of a recorded chain, exactly as applied on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRecord {
    /// Registered transform id
    pub transform_id: String,
    /// Arguments the transform was applied with
    #[serde(default)]
    pub args: TransformArgs,
}

impl TransformRecord {
    /// Record with no arguments.
    pub fn new(transform_id: impl Into<String>) -> Self {
        Self {
            transform_id: transform_id.into(),
            args: TransformArgs::new(),
        }
    }

    /// Builder-style argument insertion.
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Key id and generation recorded on this step, if it was keyed.
    pub fn key_ref(&self) -> VaultResult<Option<(String, u32)>> {
        let Some(key_id) = self.args.get(ARG_KEY_ID) else {
            return Ok(None);
        };
        let generation = self
            .args
            .get(ARG_KEY_GENERATION)
            .ok_or_else(|| {
                VaultError::Corruption(format!(
                    "step {} records a key id without a generation",
                    self.transform_id
                ))
            })?
            .parse::<u32>()
            .map_err(|e| VaultError::Corruption(format!("bad key generation: {e}")))?;
        Ok(Some((key_id.clone(), generation)))
    }
}

/// Direction a transform step runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Write path
    Apply,
    /// Read path
    Reverse,
}

/// Ephemeral step built from a recorded chain for one store or retrieve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformStep {
    /// Registered transform id
    pub transform_id: String,
    /// Apply or reverse
    pub direction: Direction,
    /// Arguments recorded at write time
    pub args: TransformArgs,
}

/// Ordered transform chain, in apply order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransformChain(Vec<TransformRecord>);

impl TransformChain {
    /// Empty chain (bytes stored verbatim).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn push(&mut self, record: TransformRecord) {
        self.0.push(record);
    }

    /// Steps in apply order.
    pub fn records(&self) -> &[TransformRecord] {
        &self.0
    }

    /// Mutable access, used to stamp key references before applying.
    pub fn records_mut(&mut self) -> &mut [TransformRecord] {
        &mut self.0
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no transform is applied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Write-path steps: the records in order.
    pub fn apply_steps(&self) -> Vec<TransformStep> {
        self.0
            .iter()
            .map(|r| TransformStep {
                transform_id: r.transform_id.clone(),
                direction: Direction::Apply,
                args: r.args.clone(),
            })
            .collect()
    }

    /// Read-path steps: the exact mirror of [`apply_steps`](Self::apply_steps).
    pub fn reverse_steps(&self) -> Vec<TransformStep> {
        self.0
            .iter()
            .rev()
            .map(|r| TransformStep {
                transform_id: r.transform_id.clone(),
                direction: Direction::Reverse,
                args: r.args.clone(),
            })
            .collect()
    }

    /// First key reference found in the chain.
    pub fn key_ref(&self) -> VaultResult<Option<(String, u32)>> {
        for record in &self.0 {
            if let Some(r) = record.key_ref()? {
                return Ok(Some(r));
            }
        }
        Ok(None)
    }

    /// Encode for storage in an index row.
    pub fn encode(&self) -> VaultResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| VaultError::ValidationFailure(format!("unencodable chain: {e}")))
    }

    /// Decode a chain previously produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> VaultResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| VaultError::Corruption(format!("undecodable transform chain: {e}")))
    }
}

impl FromIterator<TransformRecord> for TransformChain {
    fn from_iter<T: IntoIterator<Item = TransformRecord>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Blob metadata without the transform chain; cheap to read for existence and mtime checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeader {
    /// Bucket name
    pub bucket: String,
    /// Object key within the bucket
    pub key: String,
    /// BLAKE3 of the original bytes
    pub content_hash: ContentHash,
    /// Original size in bytes
    pub size: u64,
    /// Canonical storage URI of the physical bytes
    pub uri: BlobUri,
    /// Identity that wrote this version
    pub owner: String,
    /// First successful store of this (bucket, key)
    pub created_at: DateTime<Utc>,
    /// Last overwrite
    pub modified_at: DateTime<Utc>,
    /// Trace id of the operation that wrote this version
    pub trace_id: Uuid,
}

/// Full metadata of a logical blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    /// Header fields
    #[serde(flatten)]
    pub header: BlobHeader,
    /// Transform chain exactly as applied to the bytes at `header.uri`
    pub chain: TransformChain,
}

impl BlobMetadata {
    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.header.bucket
    }

    /// Object key.
    pub fn key(&self) -> &str {
        &self.header.key
    }
}

/// Reject empty, oversized or control-character bucket names.
pub fn validate_bucket(bucket: &str) -> VaultResult<()> {
    if bucket.is_empty() {
        return Err(VaultError::ValidationFailure("bucket must not be empty".into()));
    }
    if bucket.len() > MAX_BUCKET_LEN {
        return Err(VaultError::ValidationFailure(format!(
            "bucket exceeds {MAX_BUCKET_LEN} bytes"
        )));
    }
    if bucket.chars().any(|c| c.is_control() || c == '/') {
        return Err(VaultError::ValidationFailure(
            "bucket contains '/' or control characters".into(),
        ));
    }
    Ok(())
}

/// Reject empty, oversized or NUL-containing keys.
pub fn validate_key(key: &str) -> VaultResult<()> {
    if key.is_empty() {
        return Err(VaultError::ValidationFailure("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(VaultError::ValidationFailure(format!(
            "key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if key.contains('\0') {
        return Err(VaultError::ValidationFailure("key contains NUL".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> TransformChain {
        [
            TransformRecord::new("zstd").with_arg("level", "3"),
            TransformRecord::new("aes-256-gcm")
                .with_arg(ARG_KEY_ID, "default")
                .with_arg(ARG_KEY_GENERATION, "2"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn reverse_steps_mirror_apply_steps() {
        let c = chain();
        let apply = c.apply_steps();
        let reverse = c.reverse_steps();
        assert_eq!(apply.len(), reverse.len());
        assert_eq!(reverse[0].transform_id, "aes-256-gcm");
        assert_eq!(reverse[1].transform_id, "zstd");
        assert!(reverse.iter().all(|s| s.direction == Direction::Reverse));
        for (a, r) in apply.iter().zip(reverse.iter().rev()) {
            assert_eq!(a.transform_id, r.transform_id);
            assert_eq!(a.args, r.args);
        }
    }

    #[test]
    fn chain_encoding_is_stable() {
        let c = chain();
        let encoded = c.encode().unwrap();
        assert_eq!(TransformChain::decode(&encoded).unwrap(), c);
        assert!(matches!(
            TransformChain::decode(b"{not json"),
            Err(VaultError::Corruption(_))
        ));
    }

    #[test]
    fn key_ref_is_read_from_args() {
        assert_eq!(chain().key_ref().unwrap(), Some(("default".to_string(), 2)));
        let bad: TransformChain = [TransformRecord::new("aes-256-gcm").with_arg(ARG_KEY_ID, "k")]
            .into_iter()
            .collect();
        assert!(bad.key_ref().is_err());
        assert_eq!(TransformChain::new().key_ref().unwrap(), None);
    }

    #[test]
    fn uri_parse_and_display() {
        let uri: BlobUri = "file://ab/abcdef".parse().unwrap();
        assert_eq!(uri.scheme(), "file");
        assert_eq!(uri.locator(), "ab/abcdef");
        assert_eq!(uri.to_string(), "file://ab/abcdef");
        assert!("no-scheme".parse::<BlobUri>().is_err());
        assert!("file://".parse::<BlobUri>().is_err());
        assert!("FILE://x".parse::<BlobUri>().is_err());
    }

    #[test]
    fn uri_serializes_as_string() {
        let uri: BlobUri = "mem://abc".parse().unwrap();
        assert_eq!(serde_json::to_string(&uri).unwrap(), "\"mem://abc\"");
        let back: BlobUri = serde_json::from_str("\"mem://abc\"").unwrap();
        assert_eq!(back, uri);
    }

    #[test]
    fn content_hash_hex() {
        let h = ContentHash([0xab; 32]);
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(ContentHash::from_hex(&h.to_hex()).unwrap(), h);
        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex("zz").is_err());
    }

    #[test]
    fn intent_names() {
        for intent in StorageIntent::ALL {
            assert_eq!(intent.as_str().parse::<StorageIntent>().unwrap(), intent);
        }
        assert!("hot".parse::<StorageIntent>().is_err());
    }

    #[test]
    fn bucket_and_key_validation() {
        assert!(validate_bucket("docs").is_ok());
        assert!(validate_bucket("").is_err());
        assert!(validate_bucket("a/b").is_err());
        assert!(validate_bucket(&"b".repeat(MAX_BUCKET_LEN + 1)).is_err());
        assert!(validate_key("readme").is_ok());
        assert!(validate_key("nested/path/readme.md").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a\0b").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
