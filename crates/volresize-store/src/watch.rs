use crate::error::{Result, StoreError};
use crate::http::{HttpStore, CLAIMS_PATH, REQUEST_TIMEOUT, VOLUMES_PATH};
use futures_util::StreamExt;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use volresize_core::{ObjectEvent, PersistentVolume, PersistentVolumeClaim, WatchEventType};

/// Server-side lifetime requested for one watch connection
const WATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Pause before reconnecting a watch that closed or failed
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Claims,
    Volumes,
}

impl WatchKind {
    fn path(self) -> &'static str {
        match self {
            WatchKind::Claims => CLAIMS_PATH,
            WatchKind::Volumes => VOLUMES_PATH,
        }
    }
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchKind::Claims => write!(f, "claim"),
            WatchKind::Volumes => write!(f, "volume"),
        }
    }
}

/// One decoded line of a watch response
#[derive(Debug)]
enum WatchFrame {
    Event {
        event: ObjectEvent,
        version: Option<String>,
    },
    Bookmark {
        version: Option<String>,
    },
    /// The server ended the watch, typically because the version expired (410)
    Error { code: Option<u16>, message: String },
    Blank,
}

/// How a watch connection ended without a transport error
#[derive(Debug, PartialEq, Eq)]
enum WatchEnd {
    /// Closed normally; resume from the last seen version
    Closed,
    /// The version is no longer served; list again
    Expired,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    type_: String,
    object: serde_json::Value,
}

fn parse_watch_frame(kind: WatchKind, line: &[u8]) -> Result<WatchFrame> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(WatchFrame::Blank);
    }
    let what = format!("{} watch event", kind);
    let raw: RawFrame =
        serde_json::from_slice(line).map_err(|e| StoreError::decode_failed(&what, e.to_string()))?;
    let version = raw.object["metadata"]["resourceVersion"]
        .as_str()
        .map(str::to_string);

    let event_type = match raw.type_.as_str() {
        "BOOKMARK" => return Ok(WatchFrame::Bookmark { version }),
        "ERROR" => {
            return Ok(WatchFrame::Error {
                code: raw.object["code"].as_u64().and_then(|c| u16::try_from(c).ok()),
                message: raw.object["message"].as_str().unwrap_or_default().to_string(),
            })
        }
        other => serde_json::from_value::<WatchEventType>(serde_json::Value::from(other))
            .map_err(|_| StoreError::decode_failed(&what, format!("unknown type '{}'", other)))?,
    };

    let event = match kind {
        WatchKind::Claims => ObjectEvent::claim(
            event_type,
            serde_json::from_value::<PersistentVolumeClaim>(raw.object)
                .map_err(|e| StoreError::decode_failed(&what, e.to_string()))?,
        ),
        WatchKind::Volumes => ObjectEvent::volume(
            event_type,
            serde_json::from_value::<PersistentVolume>(raw.object)
                .map_err(|e| StoreError::decode_failed(&what, e.to_string()))?,
        ),
    };
    Ok(WatchFrame::Event { event, version })
}

impl HttpStore {
    /// Feed subscribers from claim and volume watches until `token` is cancelled
    ///
    /// Each watch starts with a full list published as `Added` events, then
    /// streams changes from the list's version. A closed stream resumes from
    /// the last seen version; a failed or expired one lists again.
    pub async fn run_watches(&self, token: CancellationToken) {
        info!("Watching claims and volumes at {}", self.base_url());
        tokio::join!(
            self.reflect(WatchKind::Claims, &token),
            self.reflect(WatchKind::Volumes, &token)
        );
        debug!("Watches stopped");
    }

    async fn reflect(&self, kind: WatchKind, token: &CancellationToken) {
        let mut version: Option<String> = None;
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.list_then_watch(kind, &mut version) => result,
            };
            match result {
                Ok(WatchEnd::Closed) => debug!("{} watch closed, resuming", kind),
                Ok(WatchEnd::Expired) => {
                    debug!("{} watch expired, listing again", kind);
                    version = None;
                }
                Err(e) => {
                    warn!("{} watch failed: {}", kind, e);
                    version = None;
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
            }
        }
    }

    async fn list_then_watch(
        &self,
        kind: WatchKind,
        version: &mut Option<String>,
    ) -> Result<WatchEnd> {
        if version.is_none() {
            *version = self.relist(kind).await?;
        }
        self.watch_from(kind, version).await
    }

    /// Publish every listed object as `Added`; returns the list's version
    async fn relist(&self, kind: WatchKind) -> Result<Option<String>> {
        let what = format!("{} list", kind);
        match kind {
            WatchKind::Claims => {
                let (claims, version) = self
                    .list_objects::<PersistentVolumeClaim>(kind.path(), &what)
                    .await?;
                debug!("Listed {} claims", claims.len());
                for claim in claims {
                    self.publish(ObjectEvent::claim(WatchEventType::Added, claim));
                }
                Ok(version)
            }
            WatchKind::Volumes => {
                let (volumes, version) = self
                    .list_objects::<PersistentVolume>(kind.path(), &what)
                    .await?;
                debug!("Listed {} volumes", volumes.len());
                for volume in volumes {
                    self.publish(ObjectEvent::volume(WatchEventType::Added, volume));
                }
                Ok(version)
            }
        }
    }

    async fn watch_from(&self, kind: WatchKind, version: &mut Option<String>) -> Result<WatchEnd> {
        let mut path = format!(
            "{}?watch=true&allowWatchBookmarks=true&timeoutSeconds={}",
            kind.path(),
            WATCH_TIMEOUT.as_secs()
        );
        if let Some(v) = version.as_deref() {
            path.push_str(&format!("&resourceVersion={}", v));
        }

        let resp = self
            .request(Method::GET, &path)
            .await?
            .timeout(WATCH_TIMEOUT + REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| StoreError::request_failed(format!("watch {}: {}", kind, e)))?;
        let status = resp.status();
        if status == StatusCode::GONE {
            return Ok(WatchEnd::Expired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::unexpected_status(
                format!("watch {}", kind),
                status.as_u16(),
                body,
            ));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| StoreError::request_failed(format!("watch {}: {}", kind, e)))?;
            buffer.extend_from_slice(&chunk);

            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                match parse_watch_frame(kind, &line)? {
                    WatchFrame::Event { event, version: v } => {
                        if v.is_some() {
                            *version = v;
                        }
                        self.publish(event);
                    }
                    WatchFrame::Bookmark { version: v } => {
                        if v.is_some() {
                            *version = v;
                        }
                    }
                    WatchFrame::Error { code, message } => {
                        if code != Some(410) {
                            warn!("{} watch error {:?}: {}", kind, code, message);
                        }
                        return Ok(WatchEnd::Expired);
                    }
                    WatchFrame::Blank => {}
                }
            }
        }
        Ok(WatchEnd::Closed)
    }
}
