//! Change-feed batch encoding
//!
//! Every committed batch is recorded in the collection's changelog as a
//! self-describing list of column-family-level operations. The feed
//! endpoint streams these entries to secondaries, which apply them by
//! absolute key, so re-applying an already-applied batch is a no-op.

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Logical column families within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cf {
    /// Capture records
    Default,
    Alias,
    AccessRule,
    AccessPolicy,
    Meta,
}

impl Cf {
    /// Key prefix byte partitioning the sled keyspace. A single sled batch
    /// over the prefixed keyspace is what makes a commit atomic across
    /// column families.
    pub(crate) fn prefix(self) -> u8 {
        match self {
            Cf::Default => 0x01,
            Cf::Alias => 0x02,
            Cf::AccessRule => 0x03,
            Cf::AccessPolicy => 0x04,
            Cf::Meta => 0x05,
        }
    }
}

/// Prepend the column family prefix to a key.
pub(crate) fn cf_key(cf: Cf, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(cf.prefix());
    out.extend_from_slice(key);
    out
}

/// One operation within a replicated batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum BatchOp {
    Put {
        cf: Cf,
        #[serde(with = "b64")]
        key: Vec<u8>,
        #[serde(with = "b64")]
        value: Vec<u8>,
    },
    Delete {
        cf: Cf,
        #[serde(with = "b64")]
        key: Vec<u8>,
    },
}

impl BatchOp {
    pub(crate) fn cf(&self) -> Cf {
        match self {
            BatchOp::Put { cf, .. } | BatchOp::Delete { cf, .. } => *cf,
        }
    }
}

/// One entry of the change feed as served over HTTP. The sequence number
/// is serialised as a string and the batch bytes as base64, matching the
/// wire format replay clients expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFeedEntry {
    #[serde(with = "string_u64")]
    pub sequence_number: u64,
    #[serde(with = "b64")]
    pub write_batch: Vec<u8>,
}

/// Serialise a batch for the changelog.
pub fn encode_ops(ops: &[BatchOp]) -> IndexResult<Vec<u8>> {
    Ok(serde_json::to_vec(ops)?)
}

/// Decode changelog bytes back into operations.
pub fn decode_ops(bytes: &[u8]) -> IndexResult<Vec<BatchOp>> {
    serde_json::from_slice(bytes)
        .map_err(|e| IndexError::Storage(format!("corrupt changelog entry: {}", e)))
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod string_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
