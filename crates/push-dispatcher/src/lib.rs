//! Push vendor client. Composes one data-only envelope per target and POSTs
//! the whole batch as a single HTTPS request carrying a JSON array — the
//! vendor's batch endpoint does not expose per-target granularity, so a
//! non-2xx response fails the entire batch at once.

use async_trait::async_trait;
use dto::{PushData, PushDataKind, PushMessage, PushPriority};
use models::SipCredentials;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("push dispatch failed for all {attempted} target(s): {cause}")]
pub struct PushError {
    pub attempted: usize,
    pub cause: String,
}

#[async_trait]
pub trait PushDispatcher: Send + Sync {
    /// Sends one data-only "a call is ringing" push per target. Non-fatal to
    /// the caller: the ring timer will close the call regardless.
    async fn dispatch_call_invite(
        &self,
        targets: &[String],
        call_id: &str,
        credentials: &SipCredentials,
    ) -> Result<(), PushError>;
}

pub struct HttpPushDispatcher {
    http: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl HttpPushDispatcher {
    pub fn new(endpoint: String, access_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            access_token,
        }
    }

    fn build_batch(targets: &[String], call_id: &str, credentials: &SipCredentials) -> Vec<PushMessage> {
        targets
            .iter()
            .map(|to| PushMessage {
                to: to.clone(),
                priority: PushPriority::High,
                data: PushData {
                    kind: PushDataKind::SipCall,
                    call_id: call_id.to_string(),
                    sip_credentials: credentials.clone(),
                },
            })
            .collect()
    }
}

#[async_trait]
impl PushDispatcher for HttpPushDispatcher {
    async fn dispatch_call_invite(
        &self,
        targets: &[String],
        call_id: &str,
        credentials: &SipCredentials,
    ) -> Result<(), PushError> {
        let batch = Self::build_batch(targets, call_id, credentials);
        if batch.is_empty() {
            return Ok(());
        }
        let attempted = batch.len();

        let mut req = self.http.post(&self.endpoint).json(&batch);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| PushError {
            attempted,
            cause: e.to_string(),
        })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            tracing::debug!(%status, attempted, "push vendor rejected the batch");
            Err(PushError {
                attempted,
                cause: format!("push vendor returned {status}"),
            })
        }
    }
}

/// No-op dispatcher used in orchestrator tests; records every batch it was
/// asked to send so tests can assert on "exactly one push dispatched".
pub struct RecordingPushDispatcher {
    pub sent: std::sync::Mutex<Vec<(Vec<String>, String)>>,
}

impl RecordingPushDispatcher {
    pub fn new() -> Self {
        Self {
            sent: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingPushDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushDispatcher for RecordingPushDispatcher {
    async fn dispatch_call_invite(
        &self,
        targets: &[String],
        call_id: &str,
        _credentials: &SipCredentials,
    ) -> Result<(), PushError> {
        self.sent.lock().unwrap().push((targets.to_vec(), call_id.to_string()));
        Ok(())
    }
}
