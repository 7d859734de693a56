use std::sync::Arc;
use std::time::Duration;

use kv_store::{call_key, endpoint_key, outgoing_key, KvStore, KvStoreExt};
use models::{EndpointIndex, EndpointKind};
use tokio::task::JoinHandle;

use crate::core::Orchestrator;

const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PENDING_ORIGINATE_INTERVAL: Duration = Duration::from_secs(2);

pub struct JanitorHandles {
    stale_sweep: JoinHandle<()>,
    pending_originate: JoinHandle<()>,
}

impl JanitorHandles {
    pub fn stop(self) {
        self.stale_sweep.abort();
        self.pending_originate.abort();
    }
}

/// Spawns the two periodic janitor loops as independent tasks.
/// Neither shares mutable state with the event-handling path beyond the
/// stores themselves, so it is always safe to run concurrently with it.
pub fn spawn(orchestrator: Arc<Orchestrator>) -> JanitorHandles {
    let sweep_orchestrator = Arc::clone(&orchestrator);
    let stale_sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STALE_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = stale_endpoint_sweep(&sweep_orchestrator).await {
                tracing::warn!(error = %err, "stale-endpoint sweep failed");
            }
        }
    });

    let retry_orchestrator = Arc::clone(&orchestrator);
    let pending_originate = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PENDING_ORIGINATE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = pending_originate_retry(&retry_orchestrator).await {
                tracing::warn!(error = %err, "pending-originate retry sweep failed");
            }
        }
    });

    JanitorHandles {
        stale_sweep,
        pending_originate,
    }
}

/// For every realtime endpoint row with a disposable-prefix id: if its KV
/// back-reference is gone, the row is stale (its TTL expired) and is
/// deleted; if the back-reference is present but the token record it points
/// at is gone, the row is also stale.
pub async fn stale_endpoint_sweep(o: &Orchestrator) -> Result<(), String> {
    let ids = o.realtime.list_ephemeral_endpoints().await.map_err(|e| e.to_string())?;
    for id in ids {
        let index: Option<EndpointIndex> = match o.kv.get_json(&endpoint_key(&id)).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(endpoint_id = %id, error = %err, "sweep: failed to read endpoint index, skipping");
                continue;
            }
        };

        let stale = match index {
            None => true,
            Some(index) => {
                let token_key = match index.kind {
                    EndpointKind::Call => call_key(&index.token),
                    EndpointKind::Outgoing => outgoing_key(&index.token),
                };
                match o.kv.get_raw(&token_key).await {
                    Ok(value) => value.is_none(),
                    Err(err) => {
                        tracing::warn!(endpoint_id = %id, error = %err, "sweep: failed to check token record, skipping");
                        continue;
                    }
                }
            }
        };

        if stale {
            if let Err(err) = o.realtime.delete_ephemeral_endpoint(&id).await {
                tracing::warn!(endpoint_id = %id, error = %err, "sweep: failed to delete stale endpoint");
            } else {
                tracing::debug!(endpoint_id = %id, "sweep: deleted stale ephemeral endpoint");
            }
        }
    }
    Ok(())
}

/// Fallback trigger for the registration/originate race: retries
/// any pending originate whose endpoint never produced (or whose event was
/// missed/arrived out of order relative to) an `EndpointStateChange`. Shares
/// [`Orchestrator::try_originate_pending`] with the event-driven path so the
/// lease is consumed through the same atomic get-and-delete either way —
/// a poller tick and an in-flight event for the same endpoint can never
/// both originate.
pub async fn pending_originate_retry(o: &Orchestrator) -> Result<(), String> {
    let ids = o.realtime.list_ephemeral_endpoints().await.map_err(|e| e.to_string())?;
    for id in ids {
        o.try_originate_pending(&id).await;
    }
    Ok(())
}
