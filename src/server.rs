//! HTTP API: health, service info, image upload, event launch and minting.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    allocator::{Allocator, MintReceipt, MintRequest},
    chain::{ChainClient, Contract},
    error::Error,
    launch::{ImageSource, LaunchRequest, Launcher},
    metadata::{self, Payload},
    pinning::PinningBackend,
    record::EventView,
    registry,
    storage::Store,
};

/// Everything the handlers share.
pub struct AppState<P, C> {
    pub store: Store,
    pub pinning: P,
    pub chain: C,
    pub contract: Contract,
    pub submit_timeout: Duration,
    pub mint_window: Duration,
}

impl<P, C> AppState<P, C> {
    pub fn launcher(&self) -> Launcher<'_, P, C> {
        Launcher {
            store: &self.store,
            pinning: &self.pinning,
            chain: &self.chain,
            contract: &self.contract,
            mint_window: self.mint_window,
            submit_timeout: self.submit_timeout,
        }
    }
}

type Shared<P, C> = State<Arc<AppState<P, C>>>;

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

#[derive(Serialize, Deserialize)]
struct ServiceInfo {
    name: String,
    version: String,
    /// `<module address>::<module name>`
    contract: String,
    abi: String,
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::EventNotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyLaunched(_)
            | Error::NoCapacity { .. }
            | Error::IndexUnavailable { .. }
            | Error::IndexConflict { .. } => StatusCode::CONFLICT,
            Error::ConfigurationInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::WalletRejected(_) => StatusCode::FORBIDDEN,
            Error::PinningUnavailable(_) | Error::PinningRejected(_) | Error::ChainError(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Timeout(_) | Error::OutcomeUnknown { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::RegistryWriteFailed(_) | Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(kind = self.kind(), error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.kind().into(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the API router over `state`.
pub fn router<P, C>(state: Arc<AppState<P, C>>) -> Router
where
    P: PinningBackend + 'static,
    C: ChainClient + 'static,
{
    Router::new()
        .route("/", get(service_info::<P, C>))
        .route("/healthz", get(healthz))
        .route("/upload", post(upload::<P, C>))
        .route("/events", post(create_event::<P, C>))
        .route("/events/:id", get(show_event::<P, C>))
        .route("/events/:id/mint", post(mint::<P, C>))
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn serve_http<P, C>(
    addr: SocketAddr,
    state: AppState<P, C>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()>
where
    P: PinningBackend + 'static,
    C: ChainClient + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http api listening");
    let app = router(Arc::new(state));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

async fn service_info<P, C>(State(state): Shared<P, C>) -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(ServiceInfo {
            name: "spacemint".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            contract: format!(
                "{}::{}",
                state.contract.module_address, state.contract.module_name
            ),
            abi: state.contract.abi.to_string(),
        }),
    )
}

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Uploaded {
    ipfs_hash: String,
    url: String,
}

/// Pin the raw request body as a single file.
async fn upload<P: PinningBackend, C>(
    State(state): Shared<P, C>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<Uploaded>, Error> {
    if body.is_empty() {
        return Err(Error::InvalidRequest("empty upload".into()));
    }
    let filename = params.name.unwrap_or_else(|| "upload".into());
    let hash = state
        .pinning
        .pin_file(Payload {
            filename,
            bytes: body.to_vec(),
        })
        .await?;
    Ok(Json(Uploaded {
        url: state.pinning.file_url(&hash),
        ipfs_hash: hash,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEvent {
    id: Option<String>,
    name: String,
    #[serde(default)]
    space: String,
    #[serde(default)]
    description: String,
    image: Option<String>,
    max_supply: i64,
}

async fn create_event<P: PinningBackend, C: ChainClient>(
    State(state): Shared<P, C>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventView>), Error> {
    let req: CreateEvent = parse_body(&body)?;
    let max_supply = metadata::supply(req.max_supply)?.get();
    let record = state
        .launcher()
        .launch(LaunchRequest {
            id: req.id,
            name: req.name,
            space_label: req.space,
            description: req.description,
            image: req.image.filter(|s| !s.is_empty()).map(ImageSource::Url),
            max_supply,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(record.into_view())))
}

async fn show_event<P, C>(
    State(state): Shared<P, C>,
    Path(id): Path<String>,
) -> Result<Json<EventView>, Error> {
    Ok(Json(registry::load(&state.store, &id)?.into_view()))
}

#[derive(Deserialize, Default)]
struct MintBody {
    index: Option<u32>,
    recipient: Option<String>,
}

async fn mint<P, C: ChainClient>(
    State(state): Shared<P, C>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<MintReceipt>, Error> {
    let req: MintBody = if body.is_empty() {
        MintBody::default()
    } else {
        parse_body(&body)?
    };
    let alloc = Allocator::new(&state.store, &state.chain, &state.contract, state.submit_timeout);
    let receipt = alloc
        .mint(&MintRequest {
            event_id: id,
            index: req.index,
            recipient: req.recipient,
        })
        .await?;
    Ok(Json(receipt))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::InvalidRequest(format!("malformed body: {e}")))
}
