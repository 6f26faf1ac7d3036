//! Event launch: metadata, pinning, collection creation and registration.

use std::{
    num::NonZeroU32,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    chain::{self, ChainClient, CollectionSpec, Contract, Settled},
    error::{Error, Result},
    metadata::{self, MetadataRequest, Payload},
    pinning::PinningBackend,
    record::EventRecord,
    registry::{self, RegistryEntry},
    resolver,
    storage::{self, Store},
};

/// Where the event image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Already hosted somewhere.
    Url(String),
    /// Pinned before the metadata is built.
    Upload(Payload),
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Event id; generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub space_label: String,
    pub description: String,
    pub image: Option<ImageSource>,
    pub max_supply: u32,
}

pub struct Launcher<'a, P, C> {
    pub store: &'a Store,
    pub pinning: &'a P,
    pub chain: &'a C,
    pub contract: &'a Contract,
    pub mint_window: Duration,
    pub submit_timeout: Duration,
}

impl<P: PinningBackend, C: ChainClient> Launcher<'_, P, C> {
    /// Run the whole launch. Nothing is registered unless every step succeeds.
    ///
    /// The event id is claimed before anything is pinned, so concurrent
    /// launches of one id cannot both reach the chain.
    pub async fn launch(&self, req: LaunchRequest) -> Result<EventRecord> {
        let count = metadata::supply(i64::from(req.max_supply))?;
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidRequest("name must not be empty".into()));
        }
        let id = match req.id.clone() {
            Some(id) => id,
            None => new_event_id(),
        };
        storage::validate_id(&id).map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let token = new_event_id();
        registry::claim(self.store, &id, &token)?;
        let result = self.run(&id, name, count, req).await;
        if result.is_err() {
            if let Err(e) = registry::release(self.store, &id, &token) {
                tracing::error!(event = %id, %e, "failed to release launch claim");
            }
        }
        result
    }

    async fn run(
        &self,
        id: &str,
        name: String,
        count: NonZeroU32,
        req: LaunchRequest,
    ) -> Result<EventRecord> {
        let image = match req.image {
            Some(ImageSource::Url(url)) => url,
            Some(ImageSource::Upload(file)) => {
                let hash = self.pinning.pin_file(file).await?;
                self.pinning.file_url(&hash)
            }
            None => String::new(),
        };

        let payloads = metadata::build(&MetadataRequest {
            name: name.clone(),
            space_label: req.space_label,
            description: req.description.clone(),
            image: image.clone(),
            count,
        });
        let dir = self.pinning.pin_directory(&payloads).await?;
        let resolution = resolver::resolve(self.pinning, &dir, count.get()).await;
        if resolution.uris.len() != count.get() as usize {
            return Err(Error::ConfigurationInvalid(format!(
                "resolved {} URIs for {} items",
                resolution.uris.len(),
                count
            )));
        }
        if resolution.degraded() {
            tracing::warn!(event = %id, folder = %dir.folder(), "launching with unverified metadata URIs");
        }

        let start = unix_now();
        let spec = CollectionSpec {
            name,
            description: req.description,
            uri: image,
            max_supply: count.get(),
            start,
            end: start + self.mint_window.as_secs(),
        };
        let payload = self.contract.create_collection(&spec);
        let tx = match chain::submit_settled(self.chain, &payload, self.submit_timeout).await? {
            Settled::Landed(tx) => tx,
            Settled::Missing => return Err(Error::Timeout("collection creation".into())),
            Settled::Unknown(detail) => {
                return Err(Error::ChainError(format!(
                    "collection creation timed out and could not be confirmed: {detail}"
                )))
            }
        };
        let collection_reference = self.contract.collection_reference(&tx, &spec).ok_or_else(|| {
            Error::ChainError(format!("transaction {} created no collection object", tx.hash))
        })?;
        tracing::info!(event = %id, collection = %collection_reference, tx = %tx.hash, "collection created");

        registry::write(
            self.store,
            id,
            &RegistryEntry {
                max_supply: count.get(),
                metadata_folder: dir.folder(),
                metadata_uris: resolution.uris,
                collection_reference,
                collection_name: spec.name,
                description: spec.description,
            },
        )
    }
}

/// Random 16-hex-digit event id.
pub fn new_event_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
