//! Request/response bodies for the HTTP API and the push vendor
//! envelope. Kept separate from `models` so the wire shape can drift
//! independently of the KV/SQL-resident domain types.

use models::{PushPlatform, SipCredentials};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRegisterRequest {
    pub user_id: String,
    pub push_token: String,
    pub platform: PushPlatform,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub const fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCredentialsQuery {
    pub call_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCredentialsResponse {
    pub call_id: String,
    #[serde(flatten)]
    pub credentials: SipCredentials,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTokenRequest {
    pub call_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutgoingCredentialsRequest {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCredentialsResponse {
    pub outgoing_token: String,
    #[serde(flatten)]
    pub credentials: SipCredentials,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCleanupRequest {
    pub outgoing_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub config: HealthConfig,
}

/// One message in a push-vendor batch POST: an HTTPS POST of a JSON array
/// of messages.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub priority: PushPriority,
    pub data: PushData,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPriority {
    High,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    #[serde(rename = "type")]
    pub kind: PushDataKind,
    pub call_id: String,
    pub sip_credentials: SipCredentials,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushDataKind {
    SipCall,
}
