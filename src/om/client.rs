//! Object manager client
//!
//! Every operation is one signed HTTP round trip through a pooled hyper client:
//! - store: multipart POST to `store.php`, answers `{"object_id": ...}`
//! - delete: form POST to `delete.php`, success is exactly HTTP 200
//! - url: GET `url.php?time&id&signature`, answers `{"object_url": ...}`
//! - fetch: url, then a streamed GET of the returned URL into a local file
//!
//! Nothing is retried. The protocol gives no idempotency guarantee, so retry
//! policy belongs to the caller.

use crate::config::ClientConfig;
use crate::om::multipart::MultipartForm;
use crate::om::signer::{md5_hex, RequestSigner};
use crate::om::types::{ObjectAttributes, ObjectId, ObjectUrl, Redirect, SignedRequest};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use url::Url;

const STORE_ENDPOINT: &str = "store.php";
const DELETE_ENDPOINT: &str = "delete.php";
const URL_ENDPOINT: &str = "url.php";

/// Prefix for temporary files allocated by `fetch` without a destination
const TEMP_PREFIX: &str = "omclient";

/// Object manager client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot access file {path:?}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server rejected request: {status} - {message}")]
    ServerRejected { status: StatusCode, message: String },

    #[error("download failed with status {status}")]
    DownloadFailed { status: StatusCode },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// True when the server answered but refused the request (bad signature,
    /// unknown or deleted object, expired URL). False for transport failures
    /// and local errors.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ClientError::ServerRejected { .. } | ClientError::DownloadFailed { .. }
        )
    }

    /// True when no HTTP response was obtained at all
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::ServerUnreachable(_) | ClientError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Check a collection name: non-empty, only `[a-z0-9_-]`
pub fn validate_collection(collection: &str) -> Result<()> {
    if collection.is_empty() {
        return Err(ClientError::InvalidArgument(
            "collection name cannot be empty".to_string(),
        ));
    }
    let valid = collection
        .bytes()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'));
    if !valid {
        return Err(ClientError::InvalidArgument(format!(
            "invalid collection name format: '{}'",
            collection
        )));
    }
    Ok(())
}

/// Parse the server base URL, making sure endpoint names append as path segments
pub fn parse_base_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).map_err(|e| {
        ClientError::InvalidArgument(format!("invalid server URL '{}': {}", server_url, e))
    })?;
    if url.cannot_be_a_base() {
        return Err(ClientError::InvalidArgument(format!(
            "server URL '{}' cannot be used as a base",
            server_url
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Pull a string field out of a JSON response body.
///
/// Numbers are accepted and rendered as their decimal form, since ids are
/// opaque tokens to this client.
fn json_string_field(body: &[u8], key: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    match value.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn rejection(status: StatusCode, body: &[u8]) -> ClientError {
    ClientError::ServerRejected {
        status,
        message: String::from_utf8_lossy(body).into_owned(),
    }
}

/// Object manager client
///
/// Clone is cheap - the underlying HTTP client uses Arc internally, and the
/// rest is immutable configuration.
#[derive(Clone)]
pub struct ObjectClient {
    /// Hyper HTTP client with connection pool
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    /// Shared-secret signer
    signer: RequestSigner,
    /// Server base URL, always ending with `/`
    base_url: Url,
    /// Per round-trip timeout
    timeout: Duration,
}

impl std::fmt::Debug for ObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectClient")
            .field("base_url", &self.base_url.as_str())
            .field("signer", &self.signer)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ObjectClient {
    /// Create a client with default timeouts
    pub fn new(server_url: &str, secret_key: impl Into<Vec<u8>>) -> Result<Self> {
        Self::from_config(&ClientConfig::new(server_url, secret_key))
    }

    /// Create a client from a full configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.server_url)?;

        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect_timeout));

        let tls = if config.insecure_tls {
            warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?
        } else {
            TlsConnector::new()?
        };

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .set_host(true)
            .build(https);

        Ok(Self {
            client,
            signer: RequestSigner::new(config.secret_key.clone()),
            base_url,
            timeout: config.request_timeout,
        })
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        self.base_url.join(name).map_err(|e| {
            ClientError::InvalidArgument(format!("cannot build endpoint '{}': {}", name, e))
        })
    }

    /// Send a request and wait for the response head, bounded by the timeout
    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ClientError::ServerUnreachable(e.to_string())),
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }

    /// Send a request and collect the whole body, bounded by the timeout
    async fn send_collect(&self, request: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes)> {
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ClientError::ServerUnreachable(e.to_string()))?;
            let status = response.status();
            let body = response
                .collect()
                .await
                .map_err(|e| ClientError::ServerUnreachable(format!("Body error: {}", e)))?
                .to_bytes();
            Ok::<_, ClientError>((status, body))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }

    /// Upload a file and store it as an object in `collection`.
    ///
    /// The collection name is checked before any I/O. Returns the object id
    /// from the server's JSON answer; a body without `object_id` is reported
    /// as [`ClientError::ServerRejected`].
    pub async fn store(
        &self,
        collection: &str,
        file_path: impl AsRef<Path>,
        attributes: &ObjectAttributes,
    ) -> Result<ObjectId> {
        validate_collection(collection)?;
        let file_path = file_path.as_ref();

        let data = tokio::fs::read(file_path)
            .await
            .map_err(|source| ClientError::FileAccess {
                path: file_path.to_path_buf(),
                source,
            })?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let attributes_json = attributes.to_json()?;
        let signed = self.signer.sign_store(
            RequestSigner::now(),
            collection,
            &md5_hex(&data),
            &attributes_json,
        );

        let form = Self::store_form(&signed, &file_name, &data);
        let content_type = form.content_type();
        let body = form.finish();

        let url = self.endpoint(STORE_ENDPOINT)?;
        debug!(
            operation = "store",
            url = %url,
            collection = %collection,
            size = data.len(),
            "sending request"
        );

        let request = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(body))?;

        let (status, body) = self.send_collect(request).await?;
        debug!(operation = "store", status = %status, "response received");

        match json_string_field(&body, "object_id") {
            Some(object_id) => {
                info!(collection = %collection, object_id = %object_id, "object stored");
                Ok(object_id)
            }
            None => Err(rejection(status, &body)),
        }
    }

    /// Multipart layout: signed text fields, then the file, then the signature
    fn store_form(signed: &SignedRequest, file_name: &str, data: &[u8]) -> MultipartForm {
        let mut form = MultipartForm::new();
        for (name, value) in signed.fields() {
            form = form.text(name, value);
        }
        form.file("file", file_name, data)
            .text("signature", signed.signature())
    }

    /// Delete an object.
    ///
    /// `Ok(true)` exactly when the server answers 200. Any other status is
    /// `Ok(false)` with no further detail; `Err` means no response at all.
    pub async fn delete(&self, object_id: &str) -> Result<bool> {
        let signed = self.signer.sign_object(RequestSigner::now(), object_id);

        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(signed.pairs())
            .finish();

        let url = self.endpoint(DELETE_ENDPOINT)?;
        debug!(operation = "delete", url = %url, object_id = %object_id, "sending request");

        let request = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(body)))?;

        let (status, _) = self.send_collect(request).await?;
        debug!(operation = "delete", status = %status, "response received");

        let deleted = status == StatusCode::OK;
        if deleted {
            info!(object_id = %object_id, "object deleted");
        }
        Ok(deleted)
    }

    /// Resolve the accessible URL of an object.
    ///
    /// For protected objects the URL carries its own signature and expires on
    /// the server's schedule; this client does not track that.
    pub async fn resolve_url(&self, object_id: &str) -> Result<ObjectUrl> {
        let signed = self.signer.sign_object(RequestSigner::now(), object_id);

        let mut url = self.endpoint(URL_ENDPOINT)?;
        url.query_pairs_mut().extend_pairs(signed.pairs());

        debug!(operation = "url", url = %url, object_id = %object_id, "sending request");

        let request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .body(Full::new(Bytes::new()))?;

        let (status, body) = self.send_collect(request).await?;
        debug!(operation = "url", status = %status, "response received");

        json_string_field(&body, "object_url").ok_or_else(|| rejection(status, &body))
    }

    /// Resolve an object and describe the redirect a web handler should send.
    ///
    /// Never fails: resolution errors become a 500 without `Location`.
    pub async fn stream(&self, object_id: &str) -> Redirect {
        match self.resolve_url(object_id).await {
            Ok(url) => Redirect::moved_permanently(url),
            Err(e) => {
                warn!(object_id = %object_id, error = %e, "cannot resolve object for redirect");
                Redirect::server_error()
            }
        }
    }

    /// Download an object into `destination`, or into a fresh temporary file.
    ///
    /// Returns the path written. When anything fails after the destination
    /// was opened, including a non-200 download status, the file is removed
    /// before the error is returned, even if it existed beforehand.
    pub async fn fetch(&self, object_id: &str, destination: Option<&Path>) -> Result<PathBuf> {
        let object_url = self.resolve_url(object_id).await?;

        let (target, file) = FetchTarget::open(destination).await?;

        match self.download_into(&object_url, file).await {
            Ok(size) => {
                let path = target.keep()?;
                info!(object_id = %object_id, path = ?path, bytes = size, "object fetched");
                Ok(path)
            }
            Err(e) => {
                target.discard().await;
                Err(e)
            }
        }
    }

    /// Stream a GET of `url` into `file`. The file is flushed and closed
    /// before this returns, on every path.
    async fn download_into(&self, url: &str, file: tokio::fs::File) -> Result<u64> {
        debug!(operation = "fetch", url = %url, "sending request");

        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Full::new(Bytes::new()))?;

        let response = self.send(request).await?;
        let status = response.status();
        debug!(operation = "fetch", status = %status, "response received");

        if status != StatusCode::OK {
            // Drain body to return connection to pool
            let _ = response.collect().await;
            return Err(ClientError::DownloadFailed { status });
        }

        let mut writer = BufWriter::with_capacity(256 * 1024, file);
        let mut body = BodyStream::new(response.into_body());
        let mut total_bytes = 0u64;

        while let Some(frame_result) = body.next().await {
            let frame = frame_result
                .map_err(|e| ClientError::ServerUnreachable(format!("Body error: {}", e)))?;
            if let Some(chunk) = frame.data_ref() {
                writer.write_all(chunk).await?;
                total_bytes += chunk.len() as u64;
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(total_bytes)
    }
}

/// Local file a fetch writes into.
///
/// A temporary target is removed when dropped unless `keep` is called.
struct FetchTarget {
    path: PathBuf,
    temp: Option<TempPath>,
}

impl FetchTarget {
    /// Create (or truncate) `destination`, or allocate a temporary file
    async fn open(destination: Option<&Path>) -> Result<(Self, tokio::fs::File)> {
        match destination {
            Some(path) => {
                let file = tokio::fs::File::create(path)
                    .await
                    .map_err(|source| ClientError::FileAccess {
                        path: path.to_path_buf(),
                        source,
                    })?;
                let target = FetchTarget {
                    path: path.to_path_buf(),
                    temp: None,
                };
                Ok((target, file))
            }
            None => {
                let (file, temp) = tempfile::Builder::new()
                    .prefix(TEMP_PREFIX)
                    .tempfile()
                    .map_err(|source| ClientError::FileAccess {
                        path: std::env::temp_dir(),
                        source,
                    })?
                    .into_parts();
                let target = FetchTarget {
                    path: temp.to_path_buf(),
                    temp: Some(temp),
                };
                Ok((target, tokio::fs::File::from_std(file)))
            }
        }
    }

    fn keep(self) -> Result<PathBuf> {
        if let Some(temp) = self.temp {
            temp.keep().map_err(|e| ClientError::FileAccess {
                path: e.path.to_path_buf(),
                source: e.error,
            })?;
        }
        Ok(self.path)
    }

    async fn discard(self) {
        let removed = match self.temp {
            Some(temp) => temp.close(),
            None => tokio::fs::remove_file(&self.path).await,
        };
        if let Err(e) = removed {
            warn!(path = ?self.path, error = %e, "failed to remove partial download");
        }
    }
}
