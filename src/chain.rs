//! On-chain collection contract interface.
//!
//! Every payload sent to the chain is built by [`Contract`], which knows the
//! one ABI configured for the deployment. Submission goes through a
//! [`ChainClient`]; the production client hands payloads to a signing relay
//! and confirms them on an Aptos full node.

use std::{fmt, future::Future, str::FromStr, time::Duration};

use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    config::Settings,
    error::{Error, Result},
};

/// Contract interfaces the service can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractAbi {
    /// `poap_launchpad`: collections are objects, minted by reference.
    Launchpad,
    /// Soul-bound token module: collections are addressed by owner and name.
    SoulBound,
}

impl FromStr for ContractAbi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "launchpad" => Ok(ContractAbi::Launchpad),
            "soul-bound" | "soulbound" | "soul_bound" => Ok(ContractAbi::SoulBound),
            other => Err(format!(
                "unknown CONTRACT_ABI `{other}` (expected `launchpad` or `soul-bound`)"
            )),
        }
    }
}

impl fmt::Display for ContractAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContractAbi::Launchpad => "launchpad",
            ContractAbi::SoulBound => "soul-bound",
        })
    }
}

/// An entry function call, in the wallet adapter's JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFunction {
    pub function: String,
    pub type_arguments: Vec<String>,
    pub function_arguments: Vec<Value>,
}

/// A committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxHandle {
    pub hash: String,
    pub events: Vec<Value>,
}

/// Parameters of a new collection.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: String,
    pub description: String,
    /// Collection-level URI (the event image).
    pub uri: String,
    pub max_supply: u32,
    /// Mint window, Unix seconds.
    pub start: u64,
    pub end: u64,
}

/// Everything a mint call may need, across ABIs.
#[derive(Debug, Clone)]
pub struct MintTarget<'a> {
    pub collection_reference: &'a str,
    pub collection_name: &'a str,
    pub description: &'a str,
    pub token_name: String,
    pub uri: &'a str,
    pub owner: &'a str,
    pub recipient: &'a str,
}

/// The deployed module and the ABI it speaks.
#[derive(Debug, Clone)]
pub struct Contract {
    pub module_address: String,
    pub module_name: String,
    pub abi: ContractAbi,
}

impl Contract {
    pub fn from_settings(cfg: &Settings) -> Self {
        Self {
            module_address: cfg.module_address.clone(),
            module_name: cfg.module_name.clone(),
            abi: cfg.contract_abi,
        }
    }

    fn function(&self, name: &str) -> String {
        format!("{}::{}::{}", self.module_address, self.module_name, name)
    }

    /// Payload creating a collection.
    pub fn create_collection(&self, spec: &CollectionSpec) -> EntryFunction {
        let function_arguments = match self.abi {
            ContractAbi::Launchpad => vec![
                json!(spec.name),
                json!(spec.description),
                json!(spec.uri),
                json!(spec.max_supply.to_string()),
                json!(spec.start.to_string()),
                json!(spec.end.to_string()),
                // per-wallet limit, mint fee
                json!("1"),
                json!("0"),
            ],
            ContractAbi::SoulBound => vec![
                json!(spec.description),
                json!(spec.max_supply.to_string()),
                json!(spec.name),
                json!(spec.uri),
            ],
        };
        EntryFunction {
            function: self.function("create_collection"),
            type_arguments: vec![],
            function_arguments,
        }
    }

    /// Payload minting one token bound to `target.uri`.
    pub fn mint(&self, target: &MintTarget<'_>) -> EntryFunction {
        match self.abi {
            ContractAbi::Launchpad => EntryFunction {
                function: self.function("mint_nft"),
                type_arguments: vec![],
                function_arguments: vec![json!(target.collection_reference), json!(target.uri)],
            },
            ContractAbi::SoulBound => EntryFunction {
                function: self.function("mint_soul_bound"),
                type_arguments: vec![],
                function_arguments: vec![
                    json!(target.owner),
                    json!(target.collection_name),
                    json!(target.description),
                    json!(target.token_name),
                    json!(target.uri),
                    json!([]),
                    json!([]),
                    json!([]),
                    json!(target.recipient),
                ],
            },
        }
    }

    /// Identifier later mints use to address the collection created by `tx`.
    pub fn collection_reference(&self, tx: &TxHandle, spec: &CollectionSpec) -> Option<String> {
        match self.abi {
            ContractAbi::Launchpad => collection_object_from_events(&tx.events),
            ContractAbi::SoulBound => Some(spec.name.clone()),
        }
    }
}

/// Find the created collection object's address in transaction events.
pub fn collection_object_from_events(events: &[Value]) -> Option<String> {
    const KEYS: [&str; 3] = ["collection_obj_addr", "collection_object", "object"];
    // The creation event names the address explicitly; prefer it.
    let created = events.iter().find(|ev| {
        ev.get("type")
            .and_then(Value::as_str)
            .map_or(false, |t| t.ends_with("::CollectionCreatedEvent"))
    });
    created
        .into_iter()
        .chain(events.iter())
        .find_map(|ev| {
            let data = ev.get("data")?;
            KEYS.iter()
                .find_map(|k| data.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        })
}

/// Submission and lookup of entry function transactions.
pub trait ChainClient: Send + Sync {
    /// Account the transactions are sent from.
    fn sender(&self) -> &str;

    /// Sign, submit and wait for `payload` to commit.
    fn submit(&self, payload: &EntryFunction) -> impl Future<Output = Result<TxHandle>> + Send;

    /// Look for an already committed transaction carrying `payload`.
    fn find_submitted(&self, payload: &EntryFunction)
        -> impl Future<Output = Result<Option<TxHandle>>> + Send;
}

/// Outcome of a submission whose answer may have been lost to a timeout.
#[derive(Debug)]
pub enum Settled {
    /// Committed, answered directly or found on chain afterwards.
    Landed(TxHandle),
    /// Timed out and not among the sender's recent transactions.
    Missing,
    /// Timed out and the chain lookup failed as well.
    Unknown(String),
}

/// Submit `payload` within `timeout`. When the submission times out, the
/// sender's recent transactions are searched for it under the same bound.
pub async fn submit_settled<C: ChainClient>(
    chain: &C,
    payload: &EntryFunction,
    timeout: Duration,
) -> Result<Settled> {
    match tokio::time::timeout(timeout, chain.submit(payload)).await {
        Ok(Ok(tx)) => return Ok(Settled::Landed(tx)),
        Ok(Err(Error::Timeout(stage))) => {
            tracing::warn!(function = %payload.function, %stage, "submission timed out; checking chain");
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            tracing::warn!(function = %payload.function, "submission timed out; checking chain");
        }
    }
    Ok(match tokio::time::timeout(timeout, chain.find_submitted(payload)).await {
        Ok(Ok(Some(tx))) => {
            tracing::info!(function = %payload.function, tx = %tx.hash, "timed out submission found on chain");
            Settled::Landed(tx)
        }
        Ok(Ok(None)) => Settled::Missing,
        Ok(Err(e)) => Settled::Unknown(e.to_string()),
        Err(_) => Settled::Unknown("chain lookup timed out".into()),
    })
}

/// How many recent sender transactions are scanned when reconciling.
const RECONCILE_WINDOW: usize = 25;

/// Submits through a signing relay and confirms on an Aptos full node.
#[derive(Clone)]
pub struct WalletClient {
    http: reqwest::Client,
    wallet_url: Option<String>,
    node_url: String,
    sender: String,
}

impl WalletClient {
    pub fn new(
        wallet_url: Option<&str>,
        node_url: &str,
        sender: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            wallet_url: wallet_url.map(|u| u.trim_end_matches('/').to_string()),
            node_url: node_url.trim_end_matches('/').to_string(),
            sender: sender.unwrap_or_default(),
        })
    }

    pub fn from_settings(cfg: &Settings) -> Result<Self, reqwest::Error> {
        Self::new(
            cfg.wallet_url.as_ref().map(|u| u.as_str()),
            cfg.aptos_node_url.as_str(),
            cfg.sender_address.clone(),
            cfg.request_timeout,
        )
    }

    async fn wait_for(&self, hash: &str) -> Result<TxHandle> {
        let url = format!("{}/v1/transactions/wait_by_hash/{hash}", self.node_url);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| chain_transport("confirmation", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::ChainError(format!(
                "transaction {hash} lookup returned {status}"
            )));
        }
        let tx: Value = resp
            .json()
            .await
            .map_err(|e| chain_transport("confirmation", e))?;
        if tx.get("success").and_then(Value::as_bool) != Some(true) {
            let vm_status = tx
                .get("vm_status")
                .and_then(Value::as_str)
                .unwrap_or("unknown vm status");
            return Err(Error::ChainError(format!("transaction {hash} failed: {vm_status}")));
        }
        Ok(tx_handle(hash, &tx))
    }
}

impl ChainClient for WalletClient {
    fn sender(&self) -> &str {
        &self.sender
    }

    async fn submit(&self, payload: &EntryFunction) -> Result<TxHandle> {
        let wallet = self
            .wallet_url
            .as_deref()
            .ok_or_else(|| Error::ChainError("WALLET_URL is not configured".into()))?;
        if self.sender.is_empty() {
            return Err(Error::ChainError("SENDER_ADDRESS is not configured".into()));
        }
        let body = json!({ "sender": self.sender, "data": payload });
        let resp = self
            .http
            .post(format!("{wallet}/v1/submit"))
            .json(&body)
            .send()
            .await
            .map_err(|e| chain_transport("submission", e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| chain_transport("submission", e))?;
        if status.is_client_error() {
            return Err(Error::WalletRejected(format!("{status}: {text}")));
        }
        if !status.is_success() {
            return Err(Error::ChainError(format!("wallet relay returned {status}: {text}")));
        }
        let submitted: Value = serde_json::from_str(&text)
            .map_err(|_| Error::ChainError(format!("wallet relay returned non-JSON: {text}")))?;
        let hash = submitted
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ChainError(format!("wallet relay returned no hash: {text}")))?;
        tracing::debug!(function = %payload.function, %hash, "transaction submitted");
        self.wait_for(hash).await
    }

    async fn find_submitted(&self, payload: &EntryFunction) -> Result<Option<TxHandle>> {
        let url = format!(
            "{}/v1/accounts/{}/transactions?limit={RECONCILE_WINDOW}",
            self.node_url, self.sender
        );
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| chain_transport("reconciliation", e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::ChainError(format!("account lookup returned {status}")));
        }
        let txs: Vec<Value> = resp
            .json()
            .await
            .map_err(|e| chain_transport("reconciliation", e))?;
        let args = Value::Array(payload.function_arguments.clone());
        Ok(txs
            .iter()
            .filter(|tx| tx.get("success").and_then(Value::as_bool) == Some(true))
            .find(|tx| {
                let p = &tx["payload"];
                p.get("function").and_then(Value::as_str) == Some(payload.function.as_str())
                    && p.get("arguments") == Some(&args)
            })
            .and_then(|tx| {
                let hash = tx.get("hash").and_then(Value::as_str)?;
                Some(tx_handle(hash, tx))
            }))
    }
}

fn tx_handle(hash: &str, tx: &Value) -> TxHandle {
    TxHandle {
        hash: hash.to_string(),
        events: tx
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    }
}

fn chain_transport(stage: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("chain {stage}"))
    } else {
        Error::ChainError(format!("{stage}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };
    use tokio::task;

    fn contract(abi: ContractAbi) -> Contract {
        Contract {
            module_address: "0x1".into(),
            module_name: "poap_launchpad".into(),
            abi,
        }
    }

    fn spec() -> CollectionSpec {
        CollectionSpec {
            name: "Demo".into(),
            description: "desc".into(),
            uri: "https://gw/ipfs/QmImg".into(),
            max_supply: 3,
            start: 100,
            end: 200,
        }
    }

    fn target() -> MintTarget<'static> {
        MintTarget {
            collection_reference: "0xcoll",
            collection_name: "Demo",
            description: "desc",
            token_name: "Demo #2".into(),
            uri: "https://gw/ipfs/QmMeta/sub/2.json",
            owner: "0xowner",
            recipient: "0xuser",
        }
    }

    mod settled {
        use super::{contract, spec};
        use crate::{
            chain::{submit_settled, ContractAbi, EntryFunction, Settled},
            error::Error,
            fakes::{FakeChain, Lookup, Outcome},
        };
        use std::time::Duration;

        const TIMEOUT: Duration = Duration::from_millis(100);

        fn payload() -> EntryFunction {
            contract(ContractAbi::Launchpad).create_collection(&spec())
        }

        #[tokio::test]
        async fn answered_submission_lands() {
            let chain = FakeChain::new();
            let settled = submit_settled(&chain, &payload(), TIMEOUT).await.unwrap();
            assert!(matches!(settled, Settled::Landed(tx) if tx.hash == "0xtx1"));
        }

        #[tokio::test]
        async fn lost_answer_is_found_on_chain() {
            let chain = FakeChain::new().script(&[Outcome::CommitThenHang]);
            let settled = submit_settled(&chain, &payload(), TIMEOUT).await.unwrap();
            assert!(matches!(settled, Settled::Landed(tx) if tx.hash == "0xtx1"));
            assert_eq!(chain.submissions(), 1);
        }

        #[tokio::test]
        async fn hung_submission_is_missing_or_unknown() {
            let chain = FakeChain::new().script(&[Outcome::Hang]);
            let settled = submit_settled(&chain, &payload(), TIMEOUT).await.unwrap();
            assert!(matches!(settled, Settled::Missing));

            let chain = FakeChain::new()
                .script(&[Outcome::Hang])
                .lookup(Lookup::Broken);
            let settled = submit_settled(&chain, &payload(), TIMEOUT).await.unwrap();
            assert!(matches!(settled, Settled::Unknown(_)));
        }

        #[tokio::test]
        async fn rejection_is_not_reconciled() {
            let chain = FakeChain::new().script(&[Outcome::Reject]);
            let err = submit_settled(&chain, &payload(), TIMEOUT).await.unwrap_err();
            assert!(matches!(err, Error::WalletRejected(_)));
        }
    }

    #[test]
    fn parses_abi_names() {
        assert_eq!("launchpad".parse(), Ok(ContractAbi::Launchpad));
        assert_eq!("Soul-Bound".parse(), Ok(ContractAbi::SoulBound));
        assert!("erc721".parse::<ContractAbi>().is_err());
        assert_eq!(ContractAbi::SoulBound.to_string(), "soul-bound");
    }

    #[test]
    fn launchpad_payloads() {
        let c = contract(ContractAbi::Launchpad);
        let create = c.create_collection(&spec());
        assert_eq!(create.function, "0x1::poap_launchpad::create_collection");
        assert_eq!(
            create.function_arguments,
            vec![
                json!("Demo"),
                json!("desc"),
                json!("https://gw/ipfs/QmImg"),
                json!("3"),
                json!("100"),
                json!("200"),
                json!("1"),
                json!("0"),
            ]
        );
        let mint = c.mint(&target());
        assert_eq!(mint.function, "0x1::poap_launchpad::mint_nft");
        assert_eq!(
            mint.function_arguments,
            vec![json!("0xcoll"), json!("https://gw/ipfs/QmMeta/sub/2.json")]
        );
        let wire = serde_json::to_value(&mint).unwrap();
        assert!(wire.get("typeArguments").is_some());
        assert!(wire.get("functionArguments").is_some());
    }

    #[test]
    fn soul_bound_payloads() {
        let c = contract(ContractAbi::SoulBound);
        let mint = c.mint(&target());
        assert_eq!(mint.function, "0x1::poap_launchpad::mint_soul_bound");
        assert_eq!(mint.function_arguments.len(), 9);
        assert_eq!(mint.function_arguments[0], json!("0xowner"));
        assert_eq!(mint.function_arguments[3], json!("Demo #2"));
        assert_eq!(mint.function_arguments[8], json!("0xuser"));
        let tx = TxHandle {
            hash: "0xh".into(),
            events: vec![],
        };
        assert_eq!(c.collection_reference(&tx, &spec()), Some("Demo".into()));
    }

    #[test]
    fn extracts_collection_object() {
        let events = vec![
            json!({"type": "0x1::object::TransferEvent", "data": {"object": "0xother"}}),
            json!({"type": "0x1::poap_launchpad::CollectionCreatedEvent",
                   "data": {"collection_obj_addr": "0xcoll"}}),
        ];
        assert_eq!(collection_object_from_events(&events), Some("0xcoll".into()));
        let fallback = vec![json!({"type": "x", "data": {"collection_object": "0xc2"}})];
        assert_eq!(collection_object_from_events(&fallback), Some("0xc2".into()));
        assert_eq!(collection_object_from_events(&[json!({"data": {}})]), None);
    }

    #[derive(Default)]
    struct Relay {
        submitted: Vec<Value>,
        node_success: bool,
        relay_status: Option<u16>,
    }

    type Shared = Arc<Mutex<Relay>>;

    async fn submit(State(s): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let mut relay = s.lock().unwrap();
        relay.submitted.push(body);
        match relay.relay_status {
            Some(code) => (
                StatusCode::from_u16(code).unwrap(),
                Json(json!({"error": "declined"})),
            ),
            None => (StatusCode::OK, Json(json!({"hash": "0xabc"}))),
        }
    }

    async fn wait(State(s): State<Shared>, Path(hash): Path<String>) -> Json<Value> {
        let success = s.lock().unwrap().node_success;
        Json(json!({
            "hash": hash,
            "success": success,
            "vm_status": if success { "Executed successfully" } else { "Move abort" },
            "events": [{"type": "e", "data": {"collection_obj_addr": "0xcoll"}}]
        }))
    }

    async fn account_txs() -> Json<Value> {
        Json(json!([
            {"hash": "0xold", "success": true,
             "payload": {"function": "0x1::poap_launchpad::mint_nft", "arguments": ["0xcoll", "u1"]}},
            {"hash": "0xfailed", "success": false,
             "payload": {"function": "0x1::poap_launchpad::mint_nft", "arguments": ["0xcoll", "u2"]}},
            {"hash": "0xmatch", "success": true, "events": [],
             "payload": {"function": "0x1::poap_launchpad::mint_nft", "arguments": ["0xcoll", "u2"]}}
        ]))
    }

    async fn spawn(relay: Relay) -> (SocketAddr, Shared, task::JoinHandle<()>) {
        let shared: Shared = Arc::new(Mutex::new(relay));
        let app = Router::new()
            .route("/v1/submit", post(submit))
            .route("/v1/transactions/wait_by_hash/:hash", get(wait))
            .route("/v1/accounts/:addr/transactions", get(account_txs))
            .with_state(shared.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = task::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        (addr, shared, handle)
    }

    fn client(addr: SocketAddr) -> WalletClient {
        let base = format!("http://{addr}");
        WalletClient::new(
            Some(&base),
            &base,
            Some("0xsender".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn mint_payload(uri: &str) -> EntryFunction {
        EntryFunction {
            function: "0x1::poap_launchpad::mint_nft".into(),
            type_arguments: vec![],
            function_arguments: vec![json!("0xcoll"), json!(uri)],
        }
    }

    #[tokio::test]
    async fn submit_confirms_on_node() {
        let (addr, shared, handle) = spawn(Relay {
            node_success: true,
            ..Default::default()
        })
        .await;
        let tx = client(addr).submit(&mint_payload("u1")).await.unwrap();
        assert_eq!(tx.hash, "0xabc");
        assert_eq!(collection_object_from_events(&tx.events), Some("0xcoll".into()));
        let relay = shared.lock().unwrap();
        assert_eq!(relay.submitted[0]["sender"], "0xsender");
        assert_eq!(
            relay.submitted[0]["data"]["function"],
            "0x1::poap_launchpad::mint_nft"
        );
        handle.abort();
    }

    #[tokio::test]
    async fn relay_client_error_is_wallet_rejection() {
        let (addr, _shared, handle) = spawn(Relay {
            relay_status: Some(403),
            ..Default::default()
        })
        .await;
        let err = client(addr).submit(&mint_payload("u1")).await.unwrap_err();
        assert!(matches!(err, Error::WalletRejected(_)));
        handle.abort();
    }

    #[tokio::test]
    async fn relay_server_error_is_chain_error() {
        let (addr, _shared, handle) = spawn(Relay {
            relay_status: Some(502),
            ..Default::default()
        })
        .await;
        let err = client(addr).submit(&mint_payload("u1")).await.unwrap_err();
        assert!(matches!(err, Error::ChainError(_)));
        handle.abort();
    }

    #[tokio::test]
    async fn failed_execution_is_chain_error() {
        let (addr, _shared, handle) = spawn(Relay::default()).await;
        let err = client(addr).submit(&mint_payload("u1")).await.unwrap_err();
        match err {
            Error::ChainError(msg) => assert!(msg.contains("Move abort")),
            other => panic!("unexpected {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn find_submitted_matches_successful_payload() {
        let (addr, _shared, handle) = spawn(Relay::default()).await;
        let c = client(addr);
        let found = c.find_submitted(&mint_payload("u2")).await.unwrap();
        assert_eq!(found.map(|t| t.hash), Some("0xmatch".into()));
        assert!(c.find_submitted(&mint_payload("u9")).await.unwrap().is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn unconfigured_relay_is_chain_error() {
        let c = WalletClient::new(None, "http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let err = c.submit(&mint_payload("u1")).await.unwrap_err();
        assert!(matches!(err, Error::ChainError(_)));
    }
}
