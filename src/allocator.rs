//! Mint slot allocation.
//!
//! A mint attempt loads the event, picks a free index, submits the mint call
//! and only then records the index. Recording is an atomic append-if-absent,
//! so two attempts racing for the same index can never both record it; the
//! loser reports [`Error::IndexConflict`] together with its transaction.

use std::time::Duration;

use serde::Serialize;

use crate::{
    chain::{self, ChainClient, Contract, EntryFunction, MintTarget, Settled, TxHandle},
    error::{Error, Result},
    record::EventRecord,
    registry,
    storage::Store,
};

/// One mint attempt.
#[derive(Debug, Clone, Default)]
pub struct MintRequest {
    pub event_id: String,
    /// Specific index to claim; the lowest free one otherwise.
    pub index: Option<u32>,
    /// Token receiver; defaults to the sending account.
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintReceipt {
    pub index: u32,
    pub uri: String,
    #[serde(rename = "transactionHash")]
    pub transaction: String,
}

pub struct Allocator<'a, C> {
    store: &'a Store,
    chain: &'a C,
    contract: &'a Contract,
    submit_timeout: Duration,
}

impl<'a, C: ChainClient> Allocator<'a, C> {
    pub fn new(store: &'a Store, chain: &'a C, contract: &'a Contract, submit_timeout: Duration) -> Self {
        Self {
            store,
            chain,
            contract,
            submit_timeout,
        }
    }

    pub async fn mint(&self, req: &MintRequest) -> Result<MintReceipt> {
        let record = registry::load(self.store, &req.event_id)?;
        let collection_reference = ready_collection(&record)?;
        let index = select_index(&record, req.index)?;
        let uri = record
            .uri_for(index)
            .ok_or_else(|| Error::ConfigurationInvalid(format!("no metadata URI for index {index}")))?;

        let token_name = format!("{} #{index}", record.collection_name);
        let payload = self.contract.mint(&MintTarget {
            collection_reference,
            collection_name: &record.collection_name,
            description: &record.description,
            token_name,
            uri,
            owner: self.chain.sender(),
            recipient: req.recipient.as_deref().unwrap_or(self.chain.sender()),
        });
        tracing::info!(event = %req.event_id, index, "submitting mint");
        let tx = self.submit(&payload, index).await?;

        if !registry::record_minted(self.store, &req.event_id, index).map_err(|e| {
            tracing::error!(event = %req.event_id, index, tx = %tx.hash, %e, "minted but not recorded");
            e
        })? {
            tracing::warn!(event = %req.event_id, index, tx = %tx.hash, "index recorded by a concurrent mint");
            return Err(Error::IndexConflict {
                index,
                transaction: tx.hash,
            });
        }
        tracing::info!(event = %req.event_id, index, tx = %tx.hash, "mint recorded");
        Ok(MintReceipt {
            index,
            uri: uri.to_string(),
            transaction: tx.hash,
        })
    }

    async fn submit(&self, payload: &EntryFunction, index: u32) -> Result<TxHandle> {
        match chain::submit_settled(self.chain, payload, self.submit_timeout).await? {
            Settled::Landed(tx) => Ok(tx),
            Settled::Missing => Err(Error::Timeout(format!("mint of index {index}"))),
            Settled::Unknown(detail) => Err(Error::OutcomeUnknown { index, detail }),
        }
    }
}

/// Collection reference of a fully configured event.
fn ready_collection(record: &EventRecord) -> Result<&str> {
    let reference = record
        .collection_reference
        .as_deref()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            Error::ConfigurationInvalid(format!("event {} has no collection", record.id))
        })?;
    if record.max_supply == 0 || record.metadata_uris.is_empty() {
        return Err(Error::ConfigurationInvalid(format!(
            "event {} has no metadata",
            record.id
        )));
    }
    if record.metadata_uris.len() != record.max_supply as usize {
        return Err(Error::ConfigurationInvalid(format!(
            "event {} has {} metadata URIs for a supply of {}",
            record.id,
            record.metadata_uris.len(),
            record.max_supply
        )));
    }
    Ok(reference)
}

/// Pick the index to mint: `requested` if it is free, otherwise the lowest
/// free index.
pub fn select_index(record: &EventRecord, requested: Option<u32>) -> Result<u32> {
    let minted = record.minted();
    if let Some(index) = requested {
        if !(1..=record.max_supply).contains(&index) {
            return Err(Error::IndexUnavailable {
                index,
                reason: format!("outside 1..={}", record.max_supply),
            });
        }
        if minted.contains(&index) {
            return Err(Error::IndexUnavailable {
                index,
                reason: "already minted".into(),
            });
        }
        return Ok(index);
    }
    (1..=record.max_supply)
        .find(|i| !minted.contains(i))
        .ok_or_else(|| Error::NoCapacity {
            event_id: record.id.clone(),
            max_supply: record.max_supply,
        })
}
