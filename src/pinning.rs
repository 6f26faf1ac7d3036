//! Pinata (IPFS) pinning client.

use std::{future::Future, sync::OnceLock, time::Duration};

use regex::Regex;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};

use crate::{
    config::Settings,
    error::{Error, Result},
    metadata::Payload,
};

/// A directory pinned with directory wrapping enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct PinnedDirectory {
    /// Content address of the wrapping directory.
    pub content_hash: String,
    /// Name of the directory inside the wrapper.
    pub sub_path: String,
}

impl PinnedDirectory {
    /// `<contentHash>/<subPath>`, the form stored as `metadataFolder`.
    pub fn folder(&self) -> String {
        format!("{}/{}", self.content_hash, self.sub_path)
    }
}

/// Operations the launch workflow needs from a pinning service.
pub trait PinningBackend: Send + Sync {
    /// Upload `files` as one wrapped directory.
    fn pin_directory(&self, files: &[Payload])
        -> impl Future<Output = Result<PinnedDirectory>> + Send;

    /// Upload a single file and return its content hash.
    fn pin_file(&self, file: Payload) -> impl Future<Output = Result<String>> + Send;

    /// Best-effort listing of the file references inside a pinned directory.
    fn list_directory(&self, dir: &PinnedDirectory)
        -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Retrieval URL of a pinned directory, ending in `/`.
    fn folder_url(&self, dir: &PinnedDirectory) -> String;

    /// Retrieval URL of a single pinned file.
    fn file_url(&self, content_hash: &str) -> String;
}

/// HTTP client for the Pinata API and gateway.
#[derive(Clone)]
pub struct PinataClient {
    http: reqwest::Client,
    api_url: String,
    gateway_url: String,
    jwt: Option<String>,
}

impl PinataClient {
    pub fn new(
        api_url: &str,
        gateway_url: &str,
        jwt: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            jwt,
        })
    }

    pub fn from_settings(cfg: &Settings) -> Result<Self, reqwest::Error> {
        Self::new(
            cfg.pinata_api_url.as_str(),
            cfg.gateway_url.as_str(),
            cfg.pinata_jwt.clone(),
            cfg.request_timeout,
        )
    }

    fn jwt(&self) -> Result<&str> {
        self.jwt
            .as_deref()
            .ok_or_else(|| Error::PinningRejected("PINATA_JWT is not configured".into()))
    }

    /// Post a multipart form to `pinFileToIPFS` and return the `IpfsHash`.
    async fn send_pin(&self, form: Form) -> Result<String> {
        let url = format!("{}/pinning/pinFileToIPFS", self.api_url);
        let resp = self
            .http
            .post(url)
            .bearer_auth(self.jwt()?)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(Error::PinningRejected(format!("{status}: {text}")));
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|_| Error::PinningRejected(format!("non-JSON response: {text}")))?;
        body.get("IpfsHash")
            .and_then(Value::as_str)
            .filter(|hash| !hash.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::PinningRejected(format!("response carries no IpfsHash: {text}")))
    }
}

impl PinningBackend for PinataClient {
    async fn pin_directory(&self, files: &[Payload]) -> Result<PinnedDirectory> {
        self.jwt()?;
        let sub_path = format!("poap-meta-{:016x}", rand::random::<u64>());

        let mut form = Form::new().percent_encode_noop();
        for file in files {
            let part = Part::bytes(file.bytes.clone())
                .file_name(format!("{sub_path}/{}", file.filename));
            form = form.part("file", part);
        }
        form = form
            .text("pinataMetadata", json!({ "name": sub_path }).to_string())
            .text(
                "pinataOptions",
                json!({ "wrapWithDirectory": true }).to_string(),
            );

        let content_hash = self.send_pin(form).await?;
        tracing::info!(%content_hash, %sub_path, files = files.len(), "pinned metadata directory");
        Ok(PinnedDirectory {
            content_hash,
            sub_path,
        })
    }

    async fn pin_file(&self, file: Payload) -> Result<String> {
        let part = Part::bytes(file.bytes).file_name(file.filename.clone());
        let form = Form::new()
            .part("file", part)
            .text("pinataMetadata", json!({ "name": file.filename }).to_string());
        let hash = self.send_pin(form).await?;
        tracing::info!(content_hash = %hash, filename = %file.filename, "pinned file");
        Ok(hash)
    }

    async fn list_directory(&self, dir: &PinnedDirectory) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(self.folder_url(dir))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::PinningUnavailable(format!(
                "directory listing returned {status}"
            )));
        }
        let html = resp.text().await.map_err(transport_error)?;
        Ok(extract_hrefs(&html))
    }

    fn folder_url(&self, dir: &PinnedDirectory) -> String {
        format!(
            "{}/{}/{}/",
            self.gateway_url, dir.content_hash, dir.sub_path
        )
    }

    fn file_url(&self, content_hash: &str) -> String {
        format!("{}/{}", self.gateway_url, content_hash)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout("pinning request".into())
    } else {
        Error::PinningUnavailable(e.to_string())
    }
}

/// Collect every `href` attribute value in an HTML directory listing.
pub fn extract_hrefs(html: &str) -> Vec<String> {
    static HREF: OnceLock<Regex> = OnceLock::new();
    let re = HREF.get_or_init(|| {
        Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).expect("static href pattern")
    });
    re.captures_iter(html)
        .map(|c| c[1].to_string())
        .collect()
}
