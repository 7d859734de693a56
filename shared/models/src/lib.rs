//! Domain types shared by the orchestrator core, the realtime store and the
//! HTTP API. These describe the call lifecycle and the ephemeral SIP
//! identities minted for it; they carry no store-specific code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Disposable-endpoint id prefixes. `tmp_` endpoints belong to an inbound
/// doorphone call; `out_` endpoints are minted for client-initiated outbound
/// calls.
pub const INBOUND_ENDPOINT_PREFIX: &str = "tmp_";
pub const OUTBOUND_ENDPOINT_PREFIX: &str = "out_";

pub const TEMPLATE_DOMOPHONE: &str = "tpl_domophone";
pub const TEMPLATE_CLIENT: &str = "tpl_client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Pending,
    Ringing,
    Bridged,
    Ended,
    TimedOut,
    Failed,
}

/// SIP credentials for an ephemeral endpoint, as handed to a mobile client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SipCredentials {
    pub username: String,
    pub password: String,
    pub domain: String,
}

/// The KV-resident record for `call:<callToken>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub call_id: String,
    pub call_token: String,
    pub channel_id: String,
    pub endpoint_id: String,
    pub bridge_id: Option<String>,
    pub state: CallState,
    pub credentials: SipCredentials,
    pub created_at: DateTime<Utc>,
    pub ends_not_before: DateTime<Utc>,
}

/// The KV-resident record for `channel:<channelId>` — a weak back-reference
/// used purely for lookup and cleanup. `Call` owns the endpoint; this is not
/// an ownership edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelIndex {
    pub call_token: String,
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Call,
    Outgoing,
}

/// The KV-resident record for `endpoint:<endpointId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointIndex {
    pub kind: EndpointKind,
    pub token: String,
}

/// The KV-resident record for `originate:<endpointId>` — a single-writer
/// lease saying "when this endpoint is reachable, originate into this
/// bridge with this channel".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOriginate {
    pub bridge_id: String,
    pub channel_id: String,
}

/// The KV-resident record for `outgoing:<token>` — credentials for a
/// client-initiated call, minted independently of any doorphone ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingCredentials {
    pub endpoint_id: String,
    pub credentials: SipCredentials,
}

/// Parameters for minting one ephemeral SIP endpoint in the realtime store.
#[derive(Debug, Clone)]
pub struct EphemeralEndpointSpec {
    pub id: String,
    pub username: String,
    pub password: String,
    pub context: String,
    pub template_id: String,
}

/// A durable push-target row: `push_tokens(user_id, token, platform, ...)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTarget {
    pub user_id: String,
    pub token: String,
    pub platform: PushPlatform,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    Ios,
    Android,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::TimedOut | CallState::Failed)
    }
}
