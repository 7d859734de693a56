use std::sync::Arc;
use std::time::Duration;

use dto::{CallCredentialsResponse, OutgoingCredentialsResponse};
use engine_client::{EngineClient, EngineEvent};
use kv_store::{call_key, channel_key, endpoint_key, originate_key, outgoing_key, KvStore, KvStoreExt};
use models::{
    Call, CallState, ChannelIndex, EndpointIndex, EndpointKind, EphemeralEndpointSpec,
    OutgoingCredentials, PendingOriginate, PushPlatform, PushTarget, SipCredentials,
    TEMPLATE_CLIENT, TEMPLATE_DOMOPHONE,
};
use push_dispatcher::PushDispatcher;
use realtime_store::RealtimeStore;

use crate::error::OrchestratorError;
use crate::ids;
use crate::settings::OrchestratorSettings;

/// Settle delay before adding a newly-originated outbound leg to its bridge:
/// gives the engine a moment to finish bringing the channel up.
const OUTBOUND_SETTLE_DELAY: Duration = Duration::from_millis(200);
/// Single retry delay on add-to-bridge failure for the outbound leg.
const OUTBOUND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Endpoint states the engine reports that mean "not actually reachable
/// yet": anything other than offline or unknown.
fn is_unreachable_state(state: &str) -> bool {
    matches!(state.to_ascii_lowercase().as_str(), "offline" | "unknown")
}

fn is_disposable_endpoint(endpoint_id: &str) -> bool {
    endpoint_id.starts_with(models::INBOUND_ENDPOINT_PREFIX)
        || endpoint_id.starts_with(models::OUTBOUND_ENDPOINT_PREFIX)
}

/// The per-call state machine plus the janitor sweeps. Holds no per-call
/// state of its own — everything lives in the KV store and the realtime
/// store, so a restart recovers from the stores alone.
pub struct Orchestrator {
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) realtime: Arc<dyn RealtimeStore>,
    pub(crate) engine: Arc<dyn EngineClient>,
    pub(crate) push: Arc<dyn PushDispatcher>,
    pub(crate) settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        kv: Arc<dyn KvStore>,
        realtime: Arc<dyn RealtimeStore>,
        engine: Arc<dyn EngineClient>,
        push: Arc<dyn PushDispatcher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            kv,
            realtime,
            engine,
            push,
            settings,
        }
    }

    /// Entry point for the engine event-stream reader: the socket is a
    /// single consumer, so handlers must not block it indefinitely. Each
    /// branch hands off any slow work to its own spawned task.
    pub async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::ChannelEnteredApp { channel_id, app_args } => {
                if let [kind, bridge_id] = app_args.as_slice() {
                    if kind == "outgoing" {
                        self.on_outbound_leg_entered(channel_id, bridge_id.clone());
                        return;
                    }
                }
                self.on_doorphone_leg_entered(channel_id).await;
            }
            EngineEvent::ChannelLeftApp { channel_id } => {
                self.on_channel_left_app(channel_id).await;
            }
            EngineEvent::EndpointStateChanged { endpoint_id, state } => {
                self.on_endpoint_state_changed(endpoint_id, state).await;
            }
        }
    }

    // ---- StasisStart, doorphone leg -------------------------------------

    async fn on_doorphone_leg_entered(self: &Arc<Self>, channel_id: String) {
        // Hold immediately, answer only once the client leg has joined the
        // bridge, so the doorphone never plays live audio before someone
        // is actually listening on the other end.
        if let Err(err) = self.engine.hold(&channel_id).await {
            tracing::error!(channel_id, error = %err, "failed to hold doorphone channel, abandoning call");
            return;
        }

        if let Err(err) = self.create_call(channel_id.clone()).await {
            tracing::error!(channel_id, error = %err, "failed to set up call, abandoning; TTLs and the janitor will reach a clean state");
        }
    }

    /// The composite creation step: not wrapped in a cross-store
    /// transaction. Each substep is idempotent-on-retry; failure at any
    /// point aborts before the push so no device is invited to a call with
    /// missing credentials.
    async fn create_call(self: &Arc<Self>, channel_id: String) -> Result<(), String> {
        let call_id = ids::new_call_id();
        let call_token = ids::random_token();
        let endpoint_id = ids::inbound_endpoint_id(&call_id);
        let password = ids::random_sip_password();

        let credentials = SipCredentials {
            username: endpoint_id.clone(),
            password: password.clone(),
            domain: self.settings.server_domain.clone(),
        };

        self.realtime
            .create_ephemeral_endpoint(&EphemeralEndpointSpec {
                id: endpoint_id.clone(),
                username: endpoint_id.clone(),
                password,
                context: self.settings.doorphone_context.clone(),
                template_id: TEMPLATE_DOMOPHONE.to_string(),
            })
            .await
            .map_err(|e| format!("realtime store: {e}"))?;

        let now = chrono::Utc::now();
        let mut call = Call {
            call_id: call_id.clone(),
            call_token: call_token.clone(),
            channel_id: channel_id.clone(),
            endpoint_id: endpoint_id.clone(),
            bridge_id: None,
            state: CallState::Pending,
            credentials: credentials.clone(),
            created_at: now,
            ends_not_before: now + chrono::Duration::seconds(self.settings.ring_timeout_sec as i64),
        };

        let ttl = self.settings.call_token_ttl_sec;
        self.kv
            .set_json(&call_key(&call_token), &call, ttl)
            .await
            .map_err(|e| format!("kv store: {e}"))?;
        self.kv
            .set_json(
                &channel_key(&channel_id),
                &ChannelIndex {
                    call_token: call_token.clone(),
                    endpoint_id: endpoint_id.clone(),
                },
                ttl,
            )
            .await
            .map_err(|e| format!("kv store: {e}"))?;
        self.kv
            .set_json(
                &endpoint_key(&endpoint_id),
                &EndpointIndex {
                    kind: EndpointKind::Call,
                    token: call_token.clone(),
                },
                ttl,
            )
            .await
            .map_err(|e| format!("kv store: {e}"))?;

        if let Err(err) = self.realtime.record_call(&call).await {
            tracing::warn!(call_id, error = %err, "failed to write call audit row, continuing");
        }

        let bridge_id = match self.engine.create_mixing_bridge().await {
            Ok(id) => id,
            Err(err) => {
                if let Err(audit_err) = self.realtime.update_call_state(&call_id, CallState::Failed).await {
                    tracing::warn!(call_id, error = %audit_err, "failed to mark call audit row failed");
                }
                return Err(format!("engine: {err}"));
            }
        };
        if let Err(err) = self.engine.add_channel(&bridge_id, &channel_id).await {
            if let Err(audit_err) = self.realtime.update_call_state(&call_id, CallState::Failed).await {
                tracing::warn!(call_id, error = %audit_err, "failed to mark call audit row failed");
            }
            return Err(format!("engine: {err}"));
        }

        call.bridge_id = Some(bridge_id.clone());
        if let Err(err) = self.kv.set_json(&call_key(&call_token), &call, ttl).await {
            tracing::warn!(call_id, error = %err, "failed to persist bridge id onto call record, cleanup on end will not find it");
        }

        self.kv
            .set_json(
                &originate_key(&endpoint_id),
                &PendingOriginate {
                    bridge_id: bridge_id.clone(),
                    channel_id: channel_id.clone(),
                },
                self.settings.ring_timeout_sec,
            )
            .await
            .map_err(|e| format!("kv store: {e}"))?;

        tracing::info!(call_id, %call_token, %endpoint_id, %bridge_id, "call created, dispatching push");

        match self.realtime.list_push_tokens(&self.settings.push_recipient_user_id).await {
            Ok(targets) if !targets.is_empty() => {
                let device_tokens: Vec<String> = targets.into_iter().map(|t| t.token).collect();
                if let Err(err) = self.push.dispatch_call_invite(&device_tokens, &call_id, &credentials).await {
                    tracing::warn!(call_id, error = %err, "push dispatch failed; ring timer will close the call if nobody answers");
                }
            }
            Ok(_) => {
                tracing::warn!(call_id, user_id = %self.settings.push_recipient_user_id, "no push tokens registered for recipient");
            }
            Err(err) => {
                tracing::warn!(call_id, error = %err, "failed to load push tokens");
            }
        }

        self.spawn_ring_timer(call_token, channel_id);
        Ok(())
    }

    fn spawn_ring_timer(self: &Arc<Self>, call_token: String, channel_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(this.settings.ring_timeout_sec)).await;
            match this.kv.get_raw(&call_key(&call_token)).await {
                Ok(Some(raw)) => {
                    tracing::info!(%call_token, %channel_id, "ring timeout, hanging up doorphone channel");
                    if let Err(err) = this.engine.hangup(&channel_id).await {
                        if !err.is_not_found() {
                            tracing::warn!(%channel_id, error = %err, "ring-timeout hangup failed, swallowing");
                        }
                    }
                    if let Ok(call) = serde_json::from_str::<Call>(&raw) {
                        if let Some(bridge_id) = &call.bridge_id {
                            this.teardown_bridge(bridge_id, &channel_id).await;
                        }
                        if let Err(err) = this.realtime.update_call_state(&call.call_id, CallState::TimedOut).await {
                            tracing::warn!(%call_token, error = %err, "failed to mark call audit row timed out");
                        }
                    }
                }
                Ok(None) => {
                    // Already resolved (answered, ended) before the timer fired.
                }
                Err(err) => {
                    tracing::warn!(%call_token, error = %err, "ring timer could not check call state");
                }
            }
        });
    }

    /// Hangs up any leg still joined to `bridge_id` other than
    /// `exclude_channel` (already handled by the caller), then deletes the
    /// bridge itself. Used by both the ring-timeout path and explicit
    /// `/calls/end` so a call never leaks a mixing bridge on the engine.
    async fn teardown_bridge(&self, bridge_id: &str, exclude_channel: &str) {
        match self.engine.get_bridge(bridge_id).await {
            Ok(bridge) => {
                for other in bridge.channels.iter().filter(|c| c.as_str() != exclude_channel) {
                    if let Err(err) = self.engine.hangup(other).await {
                        if !err.is_not_found() {
                            tracing::warn!(channel_id = %other, %bridge_id, error = %err, "failed to hang up bridged leg during teardown");
                        }
                    }
                }
            }
            Err(err) => {
                if !err.is_not_found() {
                    tracing::warn!(%bridge_id, error = %err, "failed to inspect bridge before teardown");
                }
            }
        }
        if let Err(err) = self.engine.delete_bridge(bridge_id).await {
            if !err.is_not_found() {
                tracing::warn!(%bridge_id, error = %err, "failed to delete bridge during teardown");
            }
        }
    }

    // ---- StasisStart, outbound (client) leg ------------------------------

    fn on_outbound_leg_entered(self: &Arc<Self>, channel_id: String, bridge_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(OUTBOUND_SETTLE_DELAY).await;

            if let Err(err) = this.engine.add_channel(&bridge_id, &channel_id).await {
                tracing::warn!(%channel_id, %bridge_id, error = %err, "add outbound channel to bridge failed, retrying once");
                tokio::time::sleep(OUTBOUND_RETRY_DELAY).await;
                if let Err(err) = this.engine.add_channel(&bridge_id, &channel_id).await {
                    tracing::error!(%channel_id, %bridge_id, error = %err, "add outbound channel to bridge failed after retry, giving up");
                    return;
                }
            }

            match this.engine.get_bridge(&bridge_id).await {
                Ok(bridge) => {
                    for other in bridge.channels.iter().filter(|c| **c != channel_id) {
                        if let Err(err) = this.engine.answer(other).await {
                            tracing::warn!(channel_id = %other, error = %err, "failed to answer bridged counterpart leg");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%bridge_id, error = %err, "failed to inspect bridge membership after join");
                }
            }
        });
    }

    // ---- EndpointStateChange ---------------------------------------------

    async fn on_endpoint_state_changed(self: &Arc<Self>, endpoint_id: String, state: String) {
        if !is_disposable_endpoint(&endpoint_id) {
            return;
        }
        if is_unreachable_state(&state) {
            return;
        }
        self.try_originate_pending(&endpoint_id).await;
    }

    /// Shared by the event-driven path and the janitor's fallback poller, both
    /// of which may fire for the same endpoint at nearly the same instant.
    /// The lease is consumed with an atomic get-and-delete, so only one of
    /// two concurrent callers ever observes `Some` and only one `originate`
    /// call is ever issued; the other returns immediately. On failure the
    /// lease is re-armed so the next trigger (event or poller tick) retries.
    pub(crate) async fn try_originate_pending(&self, endpoint_id: &str) {
        let pending: Option<PendingOriginate> = match self.kv.get_del_json(&originate_key(endpoint_id)).await {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(endpoint_id, error = %err, "failed to read pending-originate record");
                return;
            }
        };
        let Some(pending) = pending else {
            return;
        };

        let endpoint_uri = format!("PJSIP/{endpoint_id}");
        let app_args = format!("outgoing,{}", pending.bridge_id);
        match self.engine.originate(&endpoint_uri, &app_args).await {
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(endpoint_id, error = %err, "originate attempt failed, re-arming pending record for a later trigger");
                if let Err(err) = self
                    .kv
                    .set_json(&originate_key(endpoint_id), &pending, self.settings.ring_timeout_sec)
                    .await
                {
                    tracing::warn!(endpoint_id, error = %err, "failed to re-arm pending-originate record after a failed attempt");
                }
            }
        }
    }

    // ---- StasisEnd ---------------------------------------------------------

    async fn on_channel_left_app(&self, channel_id: String) {
        tracing::debug!(%channel_id, "channel left application; relying on TTL and the janitor for cleanup");
    }

    // ---- Explicit client actions -------------------------------------------

    pub async fn resolve_credentials(&self, call_token: &str) -> Result<CallCredentialsResponse, OrchestratorError> {
        let call: Option<Call> = self.kv.get_json(&call_key(call_token)).await?;
        let call = call.ok_or(OrchestratorError::NotFound)?;
        Ok(CallCredentialsResponse {
            call_id: call.call_id,
            credentials: call.credentials,
        })
    }

    pub async fn end_call(&self, call_token: &str) -> Result<(), OrchestratorError> {
        let call: Option<Call> = self.kv.get_json(&call_key(call_token)).await?;
        let call = call.ok_or(OrchestratorError::NotFound)?;

        if let Err(err) = self.engine.hangup(&call.channel_id).await {
            if !err.is_not_found() {
                tracing::warn!(%call_token, error = %err, "hangup on explicit end failed, swallowing");
            }
        }
        if let Some(bridge_id) = &call.bridge_id {
            self.teardown_bridge(bridge_id, &call.channel_id).await;
        }

        // Explicit end is client-initiated, not a race with a late reader —
        // delete now so a repeated call deterministically 404s rather than
        // waiting out callTokenTtlSec.
        let _ = self.kv.del(&call_key(call_token)).await;
        let _ = self.kv.del(&channel_key(&call.channel_id)).await;
        let _ = self.kv.del(&endpoint_key(&call.endpoint_id)).await;
        let _ = self.kv.del(&originate_key(&call.endpoint_id)).await;

        if let Err(err) = self.realtime.delete_ephemeral_endpoint(&call.endpoint_id).await {
            tracing::warn!(endpoint_id = %call.endpoint_id, error = %err, "failed to delete ephemeral endpoint on explicit end, janitor will retry");
        }
        if let Err(err) = self.realtime.update_call_state(&call.call_id, CallState::Ended).await {
            tracing::warn!(call_id = %call.call_id, error = %err, "failed to mark call audit row ended");
        }

        Ok(())
    }

    pub async fn mint_outgoing_credentials(&self) -> Result<OutgoingCredentialsResponse, OrchestratorError> {
        let outgoing_token = ids::random_token();
        let endpoint_id = ids::outbound_endpoint_id();
        let password = ids::random_sip_password();

        let credentials = SipCredentials {
            username: endpoint_id.clone(),
            password: password.clone(),
            domain: self.settings.server_domain.clone(),
        };

        self.realtime
            .create_ephemeral_endpoint(&EphemeralEndpointSpec {
                id: endpoint_id.clone(),
                username: endpoint_id.clone(),
                password,
                context: self.settings.client_context.clone(),
                template_id: TEMPLATE_CLIENT.to_string(),
            })
            .await?;

        let ttl = self.settings.call_token_ttl_sec;
        self.kv
            .set_json(
                &outgoing_key(&outgoing_token),
                &OutgoingCredentials {
                    endpoint_id: endpoint_id.clone(),
                    credentials: credentials.clone(),
                },
                ttl,
            )
            .await?;
        self.kv
            .set_json(
                &endpoint_key(&endpoint_id),
                &EndpointIndex {
                    kind: EndpointKind::Outgoing,
                    token: outgoing_token.clone(),
                },
                ttl,
            )
            .await?;

        Ok(OutgoingCredentialsResponse {
            outgoing_token,
            credentials,
        })
    }

    pub async fn cleanup_outgoing(&self, outgoing_token: &str) -> Result<(), OrchestratorError> {
        let record: Option<OutgoingCredentials> = self.kv.get_json(&outgoing_key(outgoing_token)).await?;
        let record = record.ok_or(OrchestratorError::NotFound)?;

        let _ = self.kv.del(&outgoing_key(outgoing_token)).await;
        let _ = self.kv.del(&endpoint_key(&record.endpoint_id)).await;

        if let Err(err) = self.realtime.delete_ephemeral_endpoint(&record.endpoint_id).await {
            tracing::warn!(endpoint_id = %record.endpoint_id, error = %err, "failed to delete outgoing endpoint, janitor will retry");
        }

        Ok(())
    }

    pub async fn register_push(
        &self,
        user_id: &str,
        push_token: &str,
        platform: PushPlatform,
        device_id: Option<String>,
    ) -> Result<(), OrchestratorError> {
        self.realtime.ensure_user(user_id).await?;
        self.realtime
            .save_push_token(&PushTarget {
                user_id: user_id.to_string(),
                token: push_token.to_string(),
                platform,
                device_id,
            })
            .await?;
        Ok(())
    }
}
