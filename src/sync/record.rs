//! Version descriptors handed over by the sync transport
//!
//! A descriptor never carries plaintext: content is referenced by blob
//! location, ciphertext hash and wrapped key handle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};
use crate::key_manager::DocumentKeyHandle;

/// Kind of synchronized entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Document,
    Folder,
    Tag,
    Attachment,
}

impl EntityType {
    /// Whether independent attribute edits may be merged field by field
    pub fn allows_field_merge(&self) -> bool {
        !matches!(self, EntityType::Attachment)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Document => "document",
            EntityType::Folder => "folder",
            EntityType::Tag => "tag",
            EntityType::Attachment => "attachment",
        }
    }
}

/// Encrypted payload reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    /// Storage location of the blob
    pub blob_ref: String,
    /// Hex SHA-256 of the ciphertext
    pub blob_hash: String,
    pub key: DocumentKeyHandle,
}

impl ContentRef {
    /// Same ciphertext under the same document key. Wrapped bytes are
    /// ignored: re-wrapping after a master rotation is not an edit.
    pub fn same_payload(&self, other: &ContentRef) -> bool {
        self.blob_hash == other.blob_hash
            && self.blob_ref == other.blob_ref
            && self.key.key_id == other.key.key_id
    }
}

/// One metadata field with its own edit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: serde_json::Value,
    pub modified_at: DateTime<Utc>,
}

impl Attribute {
    pub fn new(value: serde_json::Value, modified_at: DateTime<Utc>) -> Self {
        Self { value, modified_at }
    }
}

/// Snapshot of one entity on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub version_id: String,
    pub modified_at: DateTime<Utc>,
    pub content: Option<ContentRef>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl RecordVersion {
    /// Hex SHA-256 over the payload reference and attribute values.
    ///
    /// Timestamps and version ids are excluded, so two devices holding the
    /// same state agree on the digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.entity_type.as_str().as_bytes());

        match &self.content {
            Some(content) => {
                hasher.update([1u8]);
                for part in [
                    content.blob_ref.as_bytes(),
                    content.blob_hash.as_bytes(),
                    content.key.key_id.as_bytes().as_slice(),
                ] {
                    hasher.update((part.len() as u64).to_be_bytes());
                    hasher.update(part);
                }
            }
            None => hasher.update([0u8]),
        }

        // BTreeMap iteration is ordered; serde_json objects are key-sorted
        for (name, attr) in &self.attributes {
            let value = attr.value.to_string();
            hasher.update((name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    pub fn same_content(&self, other: &RecordVersion) -> bool {
        match (&self.content, &other.content) {
            (Some(a), Some(b)) => a.same_payload(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Local and remote snapshots of one entity, plus the last synced state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPair {
    pub local: RecordVersion,
    pub remote: RecordVersion,
    /// Last common synchronized version, when the transport knows it
    pub base: Option<RecordVersion>,
}

impl VersionPair {
    pub fn new(local: RecordVersion, remote: RecordVersion, base: Option<RecordVersion>) -> Self {
        Self { local, remote, base }
    }

    /// All snapshots must describe the same entity
    pub fn validate(&self) -> VaultResult<()> {
        let same = |v: &RecordVersion| {
            v.entity_id == self.local.entity_id && v.entity_type == self.local.entity_type
        };

        if !same(&self.remote) || !self.base.as_ref().map_or(true, same) {
            return Err(VaultError::VersionMismatch(format!(
                "version pair mixes entities ({} / {})",
                self.local.entity_id, self.remote.entity_id
            )));
        }
        Ok(())
    }

    pub fn entity_id(&self) -> &str {
        &self.local.entity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn handle(wrapped: u8, key_id: Uuid) -> DocumentKeyHandle {
        DocumentKeyHandle {
            key_id,
            wrapped: vec![wrapped; 72],
            master_version: wrapped as u32,
            created_at: at(0),
        }
    }

    fn version(id: &str, hash: &str, key_id: Uuid) -> RecordVersion {
        RecordVersion {
            entity_id: "doc-1".into(),
            entity_type: EntityType::Document,
            version_id: id.into(),
            modified_at: at(100),
            content: Some(ContentRef {
                blob_ref: "docs/doc-1.blob".into(),
                blob_hash: hash.into(),
                key: handle(1, key_id),
            }),
            attributes: BTreeMap::from([("title".to_string(), Attribute::new(json!("Lease"), at(50)))]),
        }
    }

    #[test]
    fn test_digest_ignores_timestamps_and_rewrap() {
        let key_id = Uuid::new_v4();
        let a = version("a", "aa", key_id);
        let mut b = version("b", "aa", key_id);
        b.modified_at = at(999);
        b.attributes.get_mut("title").unwrap().modified_at = at(900);
        b.content.as_mut().unwrap().key = handle(2, key_id);

        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_tracks_content_and_values() {
        let key_id = Uuid::new_v4();
        let a = version("a", "aa", key_id);

        let b = version("a", "bb", key_id);
        assert_ne!(a.digest(), b.digest());

        let mut c = version("a", "aa", key_id);
        c.attributes.insert("starred".into(), Attribute::new(json!(true), at(60)));
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_pair_validation() {
        let key_id = Uuid::new_v4();
        let local = version("a", "aa", key_id);
        let mut remote = version("b", "bb", key_id);
        assert!(VersionPair::new(local.clone(), remote.clone(), None).validate().is_ok());

        remote.entity_id = "doc-2".into();
        assert!(matches!(
            VersionPair::new(local, remote, None).validate(),
            Err(VaultError::VersionMismatch(_))
        ));
    }
}
