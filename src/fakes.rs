//! In-memory stand-ins for the pinning service and the chain.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use serde_json::json;

use crate::{
    chain::{ChainClient, EntryFunction, TxHandle},
    error::{Error, Result},
    metadata::Payload,
    pinning::{PinnedDirectory, PinningBackend},
};

pub const GATEWAY: &str = "https://gw.test/ipfs";
pub const COLLECTION_OBJECT: &str = "0xc011ec7";

/// What the fake gateway answers to a directory listing.
pub enum Listing {
    Unavailable,
    Entries(Vec<String>),
    /// Echo the file names of the pinned directory.
    Uploaded,
}

pub struct FakePinning {
    listing: Listing,
    fail_with: Option<fn() -> Error>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<HashMap<String, Vec<String>>>,
    pins: Mutex<u32>,
}

impl FakePinning {
    pub fn new(listing: Listing) -> Self {
        Self {
            listing,
            fail_with: None,
            files: Mutex::default(),
            dirs: Mutex::default(),
            pins: Mutex::new(0),
        }
    }

    /// Every upload fails with the error `f` builds.
    pub fn failing(mut self, f: fn() -> Error) -> Self {
        self.fail_with = Some(f);
        self
    }

    /// Bytes served at a gateway URL, if anything was pinned there.
    pub fn fetch(&self, url: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(url).cloned()
    }

    pub fn pin_count(&self) -> u32 {
        *self.pins.lock().unwrap()
    }

    fn next_hash(&self) -> Result<String> {
        if let Some(f) = self.fail_with {
            return Err(f());
        }
        let mut pins = self.pins.lock().unwrap();
        *pins += 1;
        Ok(format!("QmFake{pins}"))
    }
}

impl PinningBackend for FakePinning {
    async fn pin_directory(&self, files: &[Payload]) -> Result<PinnedDirectory> {
        let dir = PinnedDirectory {
            content_hash: self.next_hash()?,
            sub_path: "poap-meta-fake".into(),
        };
        let base = self.folder_url(&dir);
        let mut served = self.files.lock().unwrap();
        for f in files {
            served.insert(format!("{base}{}", f.filename), f.bytes.clone());
        }
        self.dirs
            .lock()
            .unwrap()
            .insert(dir.folder(), files.iter().map(|f| f.filename.clone()).collect());
        Ok(dir)
    }

    async fn pin_file(&self, file: Payload) -> Result<String> {
        let hash = self.next_hash()?;
        self.files
            .lock()
            .unwrap()
            .insert(self.file_url(&hash), file.bytes);
        Ok(hash)
    }

    async fn list_directory(&self, dir: &PinnedDirectory) -> Result<Vec<String>> {
        match &self.listing {
            Listing::Unavailable => Err(Error::PinningUnavailable("listing disabled".into())),
            Listing::Entries(hrefs) => Ok(hrefs.clone()),
            Listing::Uploaded => Ok(self
                .dirs
                .lock()
                .unwrap()
                .get(&dir.folder())
                .cloned()
                .unwrap_or_default()),
        }
    }

    fn folder_url(&self, dir: &PinnedDirectory) -> String {
        format!("{GATEWAY}/{}/{}/", dir.content_hash, dir.sub_path)
    }

    fn file_url(&self, content_hash: &str) -> String {
        format!("{GATEWAY}/{content_hash}")
    }
}

/// Scripted result of one `submit` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Commit,
    Reject,
    Fail,
    /// Never answers.
    Hang,
    /// Commits on chain, but the answer never arrives.
    CommitThenHang,
}

/// How `find_submitted` behaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup {
    Scan,
    Broken,
}

pub struct FakeChain {
    sender: String,
    delay: Duration,
    lookup: Lookup,
    script: Mutex<VecDeque<Outcome>>,
    pub submitted: Mutex<Vec<EntryFunction>>,
    landed: Mutex<Vec<(EntryFunction, TxHandle)>>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            sender: "0xsender".into(),
            delay: Duration::ZERO,
            lookup: Lookup::Scan,
            script: Mutex::default(),
            submitted: Mutex::default(),
            landed: Mutex::default(),
        }
    }

    /// Outcomes for the next submissions; afterwards every call commits.
    pub fn script(self, outcomes: &[Outcome]) -> Self {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn lookup(mut self, lookup: Lookup) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    /// Second argument of every submitted call, in order.
    pub fn minted_uris(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.function.ends_with("::create_collection"))
            .filter_map(|p| p.function_arguments.get(1)?.as_str().map(str::to_string))
            .collect()
    }

    fn commit(&self, payload: &EntryFunction) -> TxHandle {
        let mut landed = self.landed.lock().unwrap();
        let events = if payload.function.ends_with("::create_collection") {
            vec![json!({
                "type": "0x1::poap_launchpad::CollectionCreatedEvent",
                "data": { "collection_obj_addr": COLLECTION_OBJECT }
            })]
        } else {
            vec![]
        };
        let tx = TxHandle {
            hash: format!("0xtx{}", landed.len() + 1),
            events,
        };
        landed.push((payload.clone(), tx.clone()));
        tx
    }
}

impl ChainClient for FakeChain {
    fn sender(&self) -> &str {
        &self.sender
    }

    async fn submit(&self, payload: &EntryFunction) -> Result<TxHandle> {
        self.submitted.lock().unwrap().push(payload.clone());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Commit);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match outcome {
            Outcome::Commit => Ok(self.commit(payload)),
            Outcome::Reject => Err(Error::WalletRejected("user declined".into())),
            Outcome::Fail => Err(Error::ChainError("Move abort".into())),
            Outcome::Hang => std::future::pending().await,
            Outcome::CommitThenHang => {
                self.commit(payload);
                std::future::pending().await
            }
        }
    }

    async fn find_submitted(&self, payload: &EntryFunction) -> Result<Option<TxHandle>> {
        if self.lookup == Lookup::Broken {
            return Err(Error::ChainError("node unreachable".into()));
        }
        Ok(self
            .landed
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == payload)
            .map(|(_, tx)| tx.clone()))
    }
}
