//! REST + event-stream client for the telephony engine. The REST
//! surface uses `reqwest` with HTTP Basic auth in the `Authorization` header
//! (never in the URL); the event stream is a self-healing WebSocket client
//! built on `tokio-tungstenite`.

mod events;

pub use events::{EngineEvent, EventStreamHandle};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transient engine I/O error: {0}")]
    Transient(#[from] reqwest::Error),
}

impl EngineError {
    /// A 404 on channel hangup means the channel is already gone. The
    /// orchestrator's cleanup path, not this client, decides that; this just
    /// makes the check easy to express at the call site.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Status { status, .. } if *status == 404)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub id: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BridgeCreated {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelCreated {
    id: String,
}

/// Bridge, channel and endpoint control, abstracted behind a trait so the
/// orchestrator's tests can run against a fake that never touches the
/// network.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn subscribe_endpoint_events(&self) -> Result<(), EngineError>;
    async fn create_mixing_bridge(&self) -> Result<String, EngineError>;
    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), EngineError>;
    async fn get_bridge(&self, bridge_id: &str) -> Result<BridgeInfo, EngineError>;
    async fn delete_bridge(&self, bridge_id: &str) -> Result<(), EngineError>;
    async fn answer(&self, channel_id: &str) -> Result<(), EngineError>;
    async fn hold(&self, channel_id: &str) -> Result<(), EngineError>;
    async fn hangup(&self, channel_id: &str) -> Result<(), EngineError>;
    /// Originates a new channel into the orchestrator's application for
    /// `endpoint` (a `PJSIP/<id>` URI), carrying `app_args` verbatim.
    async fn originate(&self, endpoint: &str, app_args: &str) -> Result<String, EngineError>;
}

/// Talks to `http://<host>:<port>/ari`.
#[derive(Clone)]
pub struct HttpEngineClient {
    http: Client,
    base_url: String,
    user: String,
    password: String,
    app_name: String,
}

impl HttpEngineClient {
    pub fn new(base_url: String, ws_url: String, user: String, password: String, app_name: String) -> Self {
        let _ = &ws_url; // event stream is driven separately, see `connect_events`
        Self {
            http: Client::new(),
            base_url,
            user,
            password,
            app_name,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parsed<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<Option<T>, EngineError> {
        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body = resp.text().await?;
        if body.is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&body).map_err(|_| EngineError::Status {
            status: status.as_u16(),
            body: body.clone(),
        })?;
        Ok(Some(value))
    }

    async fn empty(resp: reqwest::Response) -> Result<(), EngineError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(EngineError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn subscribe_endpoint_events(&self) -> Result<(), EngineError> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/applications/{}/subscription?eventSource=endpoint:PJSIP",
                self.app_name
            )))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::empty(resp).await
    }

    async fn create_mixing_bridge(&self) -> Result<String, EngineError> {
        let resp = self
            .http
            .post(self.url("/bridges"))
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({ "type": "mixing" }))
            .send()
            .await?;
        let created: Option<BridgeCreated> = Self::parsed(resp).await?;
        created
            .map(|b| b.id)
            .ok_or_else(|| EngineError::Status {
                status: 200,
                body: "bridge creation returned no body".into(),
            })
    }

    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), EngineError> {
        let resp = self
            .http
            .post(self.url(&format!("/bridges/{bridge_id}/addChannel")))
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({ "channel": channel_id }))
            .send()
            .await?;
        Self::empty(resp).await
    }

    async fn get_bridge(&self, bridge_id: &str) -> Result<BridgeInfo, EngineError> {
        let resp = self
            .http
            .get(self.url(&format!("/bridges/{bridge_id}")))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        let info: Option<BridgeInfo> = Self::parsed(resp).await?;
        info.ok_or_else(|| EngineError::Status {
            status: 200,
            body: "bridge lookup returned no body".into(),
        })
    }

    async fn delete_bridge(&self, bridge_id: &str) -> Result<(), EngineError> {
        let resp = self
            .http
            .delete(self.url(&format!("/bridges/{bridge_id}")))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::empty(resp).await
    }

    async fn answer(&self, channel_id: &str) -> Result<(), EngineError> {
        let resp = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/answer")))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::empty(resp).await
    }

    async fn hold(&self, channel_id: &str) -> Result<(), EngineError> {
        let resp = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/hold")))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::empty(resp).await
    }

    async fn hangup(&self, channel_id: &str) -> Result<(), EngineError> {
        let resp = self
            .http
            .delete(self.url(&format!("/channels/{channel_id}")))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;
        Self::empty(resp).await
    }

    async fn originate(&self, endpoint: &str, app_args: &str) -> Result<String, EngineError> {
        let resp = self
            .http
            .post(self.url("/channels"))
            .basic_auth(&self.user, Some(&self.password))
            .json(&json!({
                "endpoint": endpoint,
                "app": self.app_name,
                "appArgs": app_args,
            }))
            .send()
            .await?;
        let created: Option<ChannelCreated> = Self::parsed(resp).await?;
        created
            .map(|c| c.id)
            .ok_or_else(|| EngineError::Status {
                status: 200,
                body: "originate returned no body".into(),
            })
    }
}
