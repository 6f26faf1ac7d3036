//! Event record model as persisted in the `spaces` collection.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Document collection holding one record per scheduled Space.
pub const SPACES: &str = "spaces";

/// Field holding the minted index history.
pub const MINTED_INDICES: &str = "mintedIndices";

/// Minting configuration of a Space.
///
/// ```json
/// {
///   "id": "9f2c01aa5e7d4b10",
///   "maxSupply": 3,
///   "metadataFolder": "QmHash/poap-meta-x1y2",
///   "metadataUris": [
///     "https://gateway.pinata.cloud/ipfs/QmHash/poap-meta-x1y2/1.json",
///     "https://gateway.pinata.cloud/ipfs/QmHash/poap-meta-x1y2/2.json",
///     "https://gateway.pinata.cloud/ipfs/QmHash/poap-meta-x1y2/3.json"
///   ],
///   "mintedIndices": [1],
///   "collectionReference": "0xabc",
///   "collectionName": "Demo",
///   "description": "desc"
/// }
/// ```
///
/// Documents may carry other fields (title, owner, schedule); they are
/// ignored here and preserved by every write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Document id, immutable.
    #[serde(default)]
    pub id: String,
    /// Number of mintable items.
    #[serde(default, deserialize_with = "lenient_u32")]
    pub max_supply: u32,
    /// `<contentHash>/<subPath>` of the pinned metadata directory.
    #[serde(default)]
    pub metadata_folder: String,
    /// Item descriptor locations; entry `i - 1` belongs to index `i`.
    #[serde(default)]
    pub metadata_uris: Vec<String>,
    /// Indices that have been minted, 1-based.
    #[serde(default, deserialize_with = "lenient_indices")]
    pub minted_indices: Vec<u32>,
    /// On-chain identifier of the backing collection.
    #[serde(default)]
    pub collection_reference: Option<String>,
    #[serde(default)]
    pub collection_name: String,
    #[serde(default)]
    pub description: String,
}

impl EventRecord {
    /// Minted indices as a set.
    pub fn minted(&self) -> BTreeSet<u32> {
        self.minted_indices.iter().copied().collect()
    }

    /// Metadata URI bound to a 1-based index.
    pub fn uri_for(&self, index: u32) -> Option<&str> {
        let slot = usize::try_from(index).ok()?.checked_sub(1)?;
        self.metadata_uris.get(slot).map(String::as_str)
    }

    /// Number of items still available.
    pub fn remaining(&self) -> u32 {
        let taken = self
            .minted()
            .into_iter()
            .filter(|i| (1..=self.max_supply).contains(i))
            .count() as u32;
        self.max_supply.saturating_sub(taken)
    }

    pub fn into_view(self) -> EventView {
        let remaining = self.remaining();
        EventView {
            record: self,
            remaining,
        }
    }
}

/// Read model of an event with its remaining capacity, as served by `show`
/// and `GET /events/:id`.
#[derive(Debug, Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub record: EventRecord,
    pub remaining: u32,
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accept a number or a numeric string; anything else reads as zero.
fn lenient_u32<'de, D: Deserializer<'de>>(de: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(de)?;
    Ok(as_u32(&value).unwrap_or(0))
}

/// Accept numbers or numeric strings, dropping entries that are neither.
fn lenient_indices<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u32>, D::Error> {
    let value = Value::deserialize(de)?;
    Ok(match value {
        Value::Array(items) => items.iter().filter_map(as_u32).collect(),
        _ => vec![],
    })
}
