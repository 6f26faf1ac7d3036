//! Event registry on top of the document store.

use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::seq::SliceRandom;
use serde_json::{json, Value};

use crate::{
    error::{Error, Result},
    record::{EventRecord, MINTED_INDICES, SPACES},
    storage::{Change, Document, Store, StoreError},
};

const METADATA_FOLDER: &str = "metadataFolder";
/// Marker held by a launch in flight: `{"token": .., "claimedAt": <unix secs>}`.
const LAUNCH_CLAIM: &str = "launchClaim";
/// Claims older than this belong to a launch that died without releasing.
const CLAIM_TTL: Duration = Duration::from_secs(60 * 60);

/// Fields written once when an event's collection is ready.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub max_supply: u32,
    pub metadata_folder: String,
    pub metadata_uris: Vec<String>,
    pub collection_reference: String,
    pub collection_name: String,
    pub description: String,
}

/// Merge `entry` into event `id`, creating the document if needed.
///
/// Unrelated fields and `mintedIndices` are left untouched. An event that
/// already has a metadata folder is never overwritten (`AlreadyLaunched`).
pub fn write(store: &Store, id: &str, entry: &RegistryEntry) -> Result<EventRecord> {
    if entry.max_supply == 0 {
        return Err(Error::ConfigurationInvalid("maxSupply must be at least 1".into()));
    }
    if entry.metadata_uris.len() != entry.max_supply as usize {
        return Err(Error::ConfigurationInvalid(format!(
            "{} metadata URIs for a supply of {}",
            entry.metadata_uris.len(),
            entry.max_supply
        )));
    }
    let mut fields = Document::new();
    fields.insert("id".into(), json!(id));
    fields.insert("maxSupply".into(), json!(entry.max_supply));
    fields.insert(METADATA_FOLDER.into(), json!(entry.metadata_folder));
    fields.insert("metadataUris".into(), json!(entry.metadata_uris));
    fields.insert("collectionReference".into(), json!(entry.collection_reference));
    fields.insert("collectionName".into(), json!(entry.collection_name));
    fields.insert("description".into(), json!(entry.description));
    let written = store
        .transact(SPACES, id, |current| {
            let mut doc = current.unwrap_or_default();
            if doc.contains_key(METADATA_FOLDER) {
                return (Change::Keep, false);
            }
            doc.remove(LAUNCH_CLAIM);
            doc.extend(fields);
            (Change::Write(doc), true)
        })
        .map_err(Error::RegistryWriteFailed)?;
    if !written {
        return Err(Error::AlreadyLaunched(id.to_string()));
    }
    tracing::info!(event = %id, max_supply = entry.max_supply, "registry entry written");
    load(store, id)
}

/// Reserve event `id` for the launch identified by `token`.
///
/// Fails with `AlreadyLaunched` when the event already has a registry entry
/// or another launch holds a claim younger than an hour. The claim is
/// cleared by [`write`] or [`release`].
pub fn claim(store: &Store, id: &str, token: &str) -> Result<()> {
    let now = unix_secs();
    let claimed = store
        .transact(SPACES, id, |current| {
            let mut doc = current.unwrap_or_default();
            let held = doc
                .get(LAUNCH_CLAIM)
                .and_then(|c| c.get("claimedAt"))
                .and_then(Value::as_u64)
                .map_or(false, |at| now.saturating_sub(at) < CLAIM_TTL.as_secs());
            if held || doc.contains_key(METADATA_FOLDER) {
                return (Change::Keep, false);
            }
            doc.insert(
                LAUNCH_CLAIM.into(),
                json!({"token": token, "claimedAt": now}),
            );
            (Change::Write(doc), true)
        })
        .map_err(Error::RegistryWriteFailed)?;
    if claimed {
        Ok(())
    } else {
        Err(Error::AlreadyLaunched(id.to_string()))
    }
}

/// Drop the claim held by `token`. A document that only carried the claim is
/// removed again.
pub fn release(store: &Store, id: &str, token: &str) -> Result<()> {
    store
        .transact(SPACES, id, |current| {
            let mut doc = match current {
                Some(doc) => doc,
                None => return (Change::Keep, ()),
            };
            let ours = doc
                .get(LAUNCH_CLAIM)
                .and_then(|c| c.get("token"))
                .and_then(Value::as_str)
                == Some(token);
            if !ours {
                return (Change::Keep, ());
            }
            doc.remove(LAUNCH_CLAIM);
            if doc.is_empty() {
                (Change::Delete, ())
            } else {
                (Change::Write(doc), ())
            }
        })
        .map_err(Error::RegistryWriteFailed)
}

/// Current state of event `id`.
pub fn load(store: &Store, id: &str) -> Result<EventRecord> {
    let doc = store
        .get(SPACES, id)
        .map_err(|e| read_error(id, e))?
        .ok_or_else(|| Error::EventNotFound(id.to_string()))?;
    parse(id, doc)
}

fn read_error(id: &str, e: StoreError) -> Error {
    match e {
        StoreError::InvalidId(_) => Error::InvalidRequest(format!("invalid event id `{id}`")),
        other => Error::Store(other),
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse(id: &str, doc: Document) -> Result<EventRecord> {
    let mut record: EventRecord = serde_json::from_value(Value::Object(doc))
        .map_err(|e| Error::ConfigurationInvalid(format!("event {id}: {e}")))?;
    if record.id.is_empty() {
        record.id = id.to_string();
    }
    Ok(record)
}

/// Append `index` to the event's minted set. Returns `false` when some other
/// attempt already recorded it.
pub fn record_minted(store: &Store, id: &str, index: u32) -> Result<bool> {
    store
        .array_union(SPACES, id, MINTED_INDICES, json!(index))
        .map_err(|e| match e {
            StoreError::NotFound { .. } => Error::EventNotFound(id.to_string()),
            StoreError::InvalidId(_) => Error::InvalidRequest(format!("invalid event id `{id}`")),
            other => Error::RegistryWriteFailed(other),
        })
}

/// A stored event breaking a registry invariant.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    UriCountMismatch { max_supply: u32, uris: usize },
    IndexOutOfRange(u32),
    DuplicateIndex(u32),
    Unreadable(String),
}

#[derive(Debug, Default)]
pub struct AuditReport {
    pub checked: usize,
    pub violations: Vec<(String, Violation)>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check stored events; with `sample`, only that many picked at random.
///
/// Documents without a supply (not yet launched) are skipped.
pub fn audit(store: &Store, sample: Option<usize>) -> Result<AuditReport> {
    let mut ids = store.list(SPACES)?;
    if let Some(n) = sample {
        ids.shuffle(&mut rand::thread_rng());
        ids.truncate(n);
        ids.sort();
    }
    let mut report = AuditReport::default();
    for id in ids {
        let record = match store.get(SPACES, &id) {
            Ok(Some(doc)) => parse(&id, doc),
            Ok(None) => continue,
            Err(e) => Err(Error::Store(e)),
        };
        report.checked += 1;
        match record {
            Ok(record) => {
                for v in check(&record) {
                    report.violations.push((id.clone(), v));
                }
            }
            Err(e) => report.violations.push((id, Violation::Unreadable(e.to_string()))),
        }
    }
    Ok(report)
}

fn check(record: &EventRecord) -> Vec<Violation> {
    let mut out = vec![];
    if record.max_supply == 0 {
        return out;
    }
    if record.metadata_uris.len() != record.max_supply as usize {
        out.push(Violation::UriCountMismatch {
            max_supply: record.max_supply,
            uris: record.metadata_uris.len(),
        });
    }
    let mut seen = BTreeSet::new();
    for &i in &record.minted_indices {
        if !(1..=record.max_supply).contains(&i) {
            out.push(Violation::IndexOutOfRange(i));
        }
        if !seen.insert(i) {
            out.push(Violation::DuplicateIndex(i));
        }
    }
    out
}
