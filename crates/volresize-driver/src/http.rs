use crate::client::DriverClient;
use crate::error::{DriverCode, DriverError, Result};
use crate::types::{DriverCapability, ExpandRequest, ExpandResponse};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// JSON-over-HTTP client for a storage driver
///
/// - `GET /identity` -> `{"name": "..."}`
/// - `GET /capabilities` -> `{"capabilities": ["CONTROLLER_SERVICE", ...]}`
/// - `POST /expand` with an `ExpandRequest` -> `ExpandResponse`
///
/// Failed calls carry `{"code": "...", "message": "..."}`.
pub struct HttpDriverClient {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct IdentityBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CapabilitiesBody {
    #[serde(default)]
    capabilities: Vec<DriverCapability>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: DriverCode,
    #[serde(default)]
    message: String,
}

impl HttpDriverClient {
    /// Build a client for `address`; a bare `host:port` means plain HTTP
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(DriverError::invalid_address(address, "address is empty"));
        }
        let base_url = if address.contains("://") {
            if !(address.starts_with("http://") || address.starts_with("https://")) {
                return Err(DriverError::invalid_address(
                    address,
                    "only http and https are supported",
                ));
            }
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriverError::invalid_address(address, e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn decode<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            return resp.json::<T>().await.map_err(|e| {
                DriverError::new(
                    DriverCode::Internal,
                    format!("failed to parse {} response: {}", what, e),
                )
            });
        }

        let body = resp.text().await.unwrap_or_default();
        Err(failure(status, &body, what))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let resp = self.client.get(&url).send().await.map_err(transport_error)?;
        Self::decode(resp, what).await
    }
}

/// Error for a failed response. Only a structured body can report a
/// missing volume.
fn failure(status: StatusCode, body: &str, what: &str) -> DriverError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => DriverError::new(err.code, err.message),
        Err(_) => DriverError::new(
            code_for_status(status),
            format!("{} failed with status {}: {}", what, status, body),
        ),
    }
}

/// Code for a failed response whose body carries no structured error
fn code_for_status(status: StatusCode) -> DriverCode {
    match status {
        // Bare 404 means a wrong route or a proxy in the way, not a missing volume
        StatusCode::NOT_FOUND => DriverCode::Unavailable,
        StatusCode::BAD_REQUEST => DriverCode::InvalidArgument,
        StatusCode::CONFLICT => DriverCode::Aborted,
        StatusCode::PRECONDITION_FAILED => DriverCode::FailedPrecondition,
        StatusCode::TOO_MANY_REQUESTS => DriverCode::ResourceExhausted,
        StatusCode::NOT_IMPLEMENTED => DriverCode::Unimplemented,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => DriverCode::Unavailable,
        StatusCode::GATEWAY_TIMEOUT => DriverCode::DeadlineExceeded,
        s if s.is_server_error() => DriverCode::Internal,
        _ => DriverCode::Unknown,
    }
}

fn transport_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::new(DriverCode::DeadlineExceeded, e.to_string())
    } else {
        DriverError::new(DriverCode::Unavailable, e.to_string())
    }
}

#[async_trait]
impl DriverClient for HttpDriverClient {
    async fn driver_name(&self) -> Result<String> {
        let body: IdentityBody = self.get("/identity", "identity").await?;
        Ok(body.name)
    }

    async fn capabilities(&self) -> Result<Vec<DriverCapability>> {
        let body: CapabilitiesBody = self.get("/capabilities", "capabilities").await?;
        Ok(body.capabilities)
    }

    async fn expand_volume(&self, request: ExpandRequest) -> Result<ExpandResponse> {
        let url = format!("{}/expand", self.base_url);
        debug!("POST {} ({})", url, request.volume_handle);
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(resp, "expand").await
    }
}
