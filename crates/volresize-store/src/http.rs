use crate::config::{ApiConfig, Credentials};
use crate::error::{Result, StoreError};
use crate::lease::LeaseLock;
use crate::limiter::RequestLimiter;
use crate::outcome::UpdateOutcome;
use crate::traits::ObjectStore;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use reqwest::{Certificate, Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use volresize_core::{ClaimKey, ObjectEvent, PersistentVolume, PersistentVolumeClaim};

pub(crate) const CLAIMS_PATH: &str = "/api/v1/persistentvolumeclaims";
pub(crate) const VOLUMES_PATH: &str = "/api/v1/persistentvolumes";

/// Upper bound for a single non-watch request
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 4096;

/// Object store backed by a Kubernetes-compatible REST API
///
/// Conditional writes rely on the server rejecting stale resourceVersions
/// with 409. Every request passes the client-side rate limiter first.
/// Change notifications come from [`HttpStore::run_watches`].
pub struct HttpStore {
    base_url: String,
    client: Client,
    credentials: Credentials,
    limiter: RequestLimiter,
    lease_namespace: String,
    event_tx: broadcast::Sender<ObjectEvent>,
}

impl HttpStore {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let server = config.server.trim_end_matches('/').to_string();
        if server.is_empty() {
            return Err(StoreError::config("API server URL is empty"));
        }

        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(pem) = &config.root_ca {
            let cert = Certificate::from_pem(pem)
                .map_err(|e| StoreError::config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if config.insecure_skip_tls_verify {
            warn!("TLS verification of {} is disabled", server);
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::config(format!("failed to build HTTP client: {}", e)))?;

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            base_url: server,
            client,
            credentials: config.credentials,
            limiter: RequestLimiter::new(config.qps, config.burst),
            lease_namespace: volresize_core::DEFAULT_NAMESPACE.to_string(),
            event_tx,
        })
    }

    /// Namespace in which leader-election leases are kept
    pub fn with_lease_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.lease_namespace = namespace.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn claim_path(key: &ClaimKey) -> String {
        format!(
            "/api/v1/namespaces/{}/persistentvolumeclaims/{}",
            key.namespace, key.name
        )
    }

    fn lease_path(&self, name: &str) -> String {
        format!(
            "/apis/coordination.k8s.io/v1/namespaces/{}/leases/{}",
            self.lease_namespace, name
        )
    }

    /// Start a request once the rate limiter allows it, with credentials attached
    pub(crate) async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        self.limiter.acquire().await;
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let builder = self.client.request(method, url);
        Ok(match &self.credentials {
            Credentials::Anonymous => builder,
            Credentials::Token(token) => builder.bearer_auth(token),
            Credentials::TokenFile(file) => {
                let token = tokio::fs::read_to_string(file).await.map_err(|e| {
                    StoreError::request_failed(format!(
                        "failed to read token {}: {}",
                        file.display(),
                        e
                    ))
                })?;
                builder.bearer_auth(token.trim())
            }
        })
    }

    pub(crate) fn publish(&self, event: ObjectEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    /// GET a single object; 404 maps to `Ok(None)`
    async fn get_optional<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Option<T>> {
        let resp = self
            .request(Method::GET, path)
            .await?
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                StoreError::request_failed(format!("GET {}{}: {}", self.base_url, path, e))
            })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::unexpected_status(
                format!("GET {}", what),
                status.as_u16(),
                body,
            ));
        }

        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| StoreError::decode_failed(what, e.to_string()))
    }

    /// GET a collection: the items that parse, and the list's resourceVersion
    pub(crate) async fn list_objects<T: DeserializeOwned>(
        &self,
        path: &str,
        what: &str,
    ) -> Result<(Vec<T>, Option<String>)> {
        let body: serde_json::Value = self.get_optional(path, what).await?.unwrap_or_default();
        let version = body["metadata"]["resourceVersion"]
            .as_str()
            .map(str::to_string);
        let items = body["items"].as_array().cloned().unwrap_or_default();

        let mut objects = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<T>(item) {
                Ok(o) => objects.push(o),
                Err(e) => warn!("Failed to parse item of {}: {}", what, e),
            }
        }
        Ok((objects, version))
    }

    /// PUT/POST an object and classify the answer
    async fn write<T: Serialize + DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        object: &T,
        what: &str,
    ) -> UpdateOutcome<T> {
        let builder = match self.request(method.clone(), path).await {
            Ok(b) => b,
            Err(e) => return UpdateOutcome::Failed(e),
        };
        let resp = match builder.timeout(REQUEST_TIMEOUT).json(object).send().await {
            Ok(r) => r,
            Err(e) => {
                return UpdateOutcome::Failed(StoreError::request_failed(format!(
                    "{} {}{}: {}",
                    method, self.base_url, path, e
                )))
            }
        };

        match resp.status() {
            StatusCode::NOT_FOUND => UpdateOutcome::NotFound,
            StatusCode::CONFLICT => UpdateOutcome::Conflict {
                current_version: None,
            },
            status if status.is_success() => match resp.json::<T>().await {
                Ok(stored) => UpdateOutcome::Updated(stored),
                Err(e) => UpdateOutcome::Failed(StoreError::decode_failed(what, e.to_string())),
            },
            status => {
                let body = resp.text().await.unwrap_or_default();
                UpdateOutcome::Failed(StoreError::unexpected_status(
                    format!("{} {}", method, what),
                    status.as_u16(),
                    body,
                ))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<Option<PersistentVolumeClaim>> {
        self.get_optional(&Self::claim_path(key), "claim").await
    }

    async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        let (claims, _) = self.list_objects(CLAIMS_PATH, "claim list").await?;
        Ok(claims)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.get_optional(&format!("{}/{}", VOLUMES_PATH, name), "volume")
            .await
    }

    async fn update_claim_status(
        &self,
        claim: PersistentVolumeClaim,
    ) -> UpdateOutcome<PersistentVolumeClaim> {
        let key = match ClaimKey::from_claim(&claim) {
            Ok(k) => k,
            Err(e) => return UpdateOutcome::Failed(e.into()),
        };
        let path = format!("{}/status", Self::claim_path(&key));
        self.write(Method::PUT, &path, &claim, "claim status")
            .await
    }

    async fn update_volume(&self, volume: PersistentVolume) -> UpdateOutcome<PersistentVolume> {
        let Some(name) = volume.metadata.name.as_deref() else {
            return UpdateOutcome::Failed(StoreError::invalid_object("volume has no name"));
        };
        let path = format!("{}/{}", VOLUMES_PATH, name);
        self.write(Method::PUT, &path, &volume, "volume")
            .await
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let path = format!("/api/v1/namespaces/{}/secrets/{}", namespace, name);
        let Some(secret) = self.get_optional::<Secret>(&path, "secret").await? else {
            return Ok(None);
        };

        let mut data: BTreeMap<String, String> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect();
        data.extend(secret.string_data.unwrap_or_default());
        Ok(Some(data))
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectEvent> {
        self.event_tx.subscribe()
    }
}

#[async_trait]
impl LeaseLock for HttpStore {
    async fn try_acquire_or_renew(
        &self,
        name: &str,
        identity: &str,
        lease_duration: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let duration_secs = lease_duration.as_secs().max(1) as i32;
        let path = self.lease_path(name);

        let Some(mut lease) = self.get_optional::<Lease>(&path, "lease").await? else {
            let mut lease = Lease::default();
            lease.metadata.name = Some(name.to_string());
            lease.metadata.namespace = Some(self.lease_namespace.clone());
            lease.spec = Some(LeaseSpec {
                holder_identity: Some(identity.to_string()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(duration_secs),
                lease_transitions: Some(0),
                ..Default::default()
            });
            let collection = format!(
                "/apis/coordination.k8s.io/v1/namespaces/{}/leases",
                self.lease_namespace
            );
            return match self
                .write(Method::POST, &collection, &lease, "lease")
                .await
            {
                UpdateOutcome::Updated(_) => Ok(true),
                UpdateOutcome::Conflict { .. } => Ok(false),
                UpdateOutcome::NotFound => Err(StoreError::unexpected_status(
                    "POST lease",
                    404,
                    format!("namespace {} not found", self.lease_namespace),
                )),
                UpdateOutcome::Failed(e) => Err(e),
            };
        };

        let spec = lease.spec.get_or_insert_with(Default::default);
        let holder = spec.holder_identity.clone().filter(|h| !h.is_empty());
        if let Some(holder) = holder.as_deref().filter(|h| *h != identity) {
            let renewed = spec.renew_time.as_ref().map(|t| t.0);
            let held_for = chrono::Duration::seconds(spec.lease_duration_seconds.unwrap_or(0) as i64);
            if renewed.is_some_and(|r| r + held_for > now) {
                debug!("Lease {} is held by {}", name, holder);
                return Ok(false);
            }
        }

        if holder.as_deref() != Some(identity) {
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.holder_identity = Some(identity.to_string());
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(duration_secs);

        match self.write(Method::PUT, &path, &lease, "lease").await {
            UpdateOutcome::Updated(_) => Ok(true),
            UpdateOutcome::Conflict { .. } | UpdateOutcome::NotFound => Ok(false),
            UpdateOutcome::Failed(e) => Err(e),
        }
    }

    async fn release(&self, name: &str, identity: &str) -> Result<()> {
        let path = self.lease_path(name);
        let Some(mut lease) = self.get_optional::<Lease>(&path, "lease").await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(identity) {
            return Ok(());
        }
        spec.holder_identity = None;

        match self.write(Method::PUT, &path, &lease, "lease").await {
            UpdateOutcome::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    async fn holder(&self, name: &str) -> Result<Option<String>> {
        let lease = self
            .get_optional::<Lease>(&self.lease_path(name), "lease")
            .await?;
        Ok(lease
            .and_then(|l| l.spec)
            .and_then(|s| s.holder_identity)
            .filter(|h| !h.is_empty()))
    }
}
