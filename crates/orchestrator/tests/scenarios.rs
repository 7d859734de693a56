//! End-to-end scenarios from the orchestrator's testable properties: fake
//! stores and engine client stand in for Redis/Postgres/the telephony
//! engine so the state machine can be exercised without any live service.

use async_trait::async_trait;
use engine_client::{BridgeInfo, EngineClient, EngineError, EngineEvent};
use kv_store::{call_key, originate_key, InMemoryKvStore, KvStore, KvStoreExt};
use orchestrator::{Orchestrator, OrchestratorSettings};
use push_dispatcher::RecordingPushDispatcher;
use realtime_store::InMemoryRealtimeStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeEngineClient {
    next_id: AtomicU64,
    bridges_created: Mutex<Vec<String>>,
    add_channel_calls: Mutex<Vec<(String, String)>>,
    hangup_calls: Mutex<Vec<String>>,
    originate_calls: Mutex<Vec<(String, String)>>,
    delete_bridge_calls: Mutex<Vec<String>>,
    bridge_channels: Mutex<HashMap<String, Vec<String>>>,
    fail_create_bridge: std::sync::atomic::AtomicBool,
}

impl FakeEngineClient {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl EngineClient for FakeEngineClient {
    async fn subscribe_endpoint_events(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_mixing_bridge(&self) -> Result<String, EngineError> {
        if self.fail_create_bridge.load(Ordering::SeqCst) {
            return Err(EngineError::Status {
                status: 503,
                body: "engine unavailable".into(),
            });
        }
        let id = self.next("B");
        self.bridges_created.lock().unwrap().push(id.clone());
        self.bridge_channels.lock().unwrap().insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn add_channel(&self, bridge_id: &str, channel_id: &str) -> Result<(), EngineError> {
        self.add_channel_calls.lock().unwrap().push((bridge_id.to_string(), channel_id.to_string()));
        self.bridge_channels
            .lock()
            .unwrap()
            .entry(bridge_id.to_string())
            .or_default()
            .push(channel_id.to_string());
        Ok(())
    }

    async fn get_bridge(&self, bridge_id: &str) -> Result<BridgeInfo, EngineError> {
        let channels = self.bridge_channels.lock().unwrap().get(bridge_id).cloned().unwrap_or_default();
        Ok(BridgeInfo {
            id: bridge_id.to_string(),
            channels,
        })
    }

    async fn delete_bridge(&self, bridge_id: &str) -> Result<(), EngineError> {
        self.delete_bridge_calls.lock().unwrap().push(bridge_id.to_string());
        self.bridge_channels.lock().unwrap().remove(bridge_id);
        Ok(())
    }

    async fn answer(&self, _channel_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn hold(&self, _channel_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> Result<(), EngineError> {
        self.hangup_calls.lock().unwrap().push(channel_id.to_string());
        Ok(())
    }

    async fn originate(&self, endpoint: &str, app_args: &str) -> Result<String, EngineError> {
        self.originate_calls.lock().unwrap().push((endpoint.to_string(), app_args.to_string()));
        Ok(self.next("CH"))
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        server_domain: "intercom.example".into(),
        call_token_ttl_sec: 5,
        ring_timeout_sec: 2,
        doorphone_context: "from-intercom".into(),
        client_context: "from-client".into(),
        push_recipient_user_id: "101".into(),
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<FakeEngineClient>,
    push: Arc<RecordingPushDispatcher>,
    kv: Arc<InMemoryKvStore>,
}

fn build_harness() -> Harness {
    let kv = Arc::new(InMemoryKvStore::new());
    let realtime = Arc::new(InMemoryRealtimeStore::new());
    let engine = Arc::new(FakeEngineClient::default());
    let push = Arc::new(RecordingPushDispatcher::new());

    let orchestrator = Arc::new(Orchestrator::new(
        kv.clone(),
        realtime,
        engine.clone(),
        push.clone(),
        settings(),
    ));

    Harness {
        orchestrator,
        engine,
        push,
        kv,
    }
}

async fn seed_push_target(h: &Harness) {
    h.orchestrator
        .register_push("101", "device-token-A", models::PushPlatform::Ios, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_creates_bridge_pushes_and_records_pending_originate() {
    let h = build_harness();
    seed_push_target(&h).await;

    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH1".into(),
            app_args: vec![],
        })
        .await;

    assert_eq!(h.engine.bridges_created.lock().unwrap().len(), 1);
    let bridge_id = h.engine.bridges_created.lock().unwrap()[0].clone();
    assert_eq!(
        h.engine.add_channel_calls.lock().unwrap().as_slice(),
        &[(bridge_id.clone(), "CH1".to_string())]
    );
    assert_eq!(h.push.sent.lock().unwrap().len(), 1);

    // Find the call token via the channel index written during creation.
    let channel_index: Option<models::ChannelIndex> = h.kv.get_json(&kv_store::channel_key("CH1")).await.unwrap();
    let channel_index = channel_index.expect("channel index must be written");
    let pending: Option<models::PendingOriginate> =
        h.kv.get_json(&originate_key(&channel_index.endpoint_id)).await.unwrap();
    assert!(pending.is_some());

    // Endpoint-state-change then triggers exactly one originate and clears it.
    h.orchestrator
        .handle_event(EngineEvent::EndpointStateChanged {
            endpoint_id: channel_index.endpoint_id.clone(),
            state: "online".into(),
        })
        .await;

    assert_eq!(h.engine.originate_calls.lock().unwrap().len(), 1);
    let pending_after: Option<models::PendingOriginate> =
        h.kv.get_json(&originate_key(&channel_index.endpoint_id)).await.unwrap();
    assert!(pending_after.is_none());

    // The outbound leg then joins the same bridge.
    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH2".into(),
            app_args: vec!["outgoing".into(), bridge_id.clone()],
        })
        .await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(h
        .engine
        .add_channel_calls
        .lock()
        .unwrap()
        .contains(&(bridge_id, "CH2".to_string())));
}

#[tokio::test(start_paused = true)]
async fn ring_timeout_hangs_up_doorphone_channel_once() {
    let h = build_harness();
    seed_push_target(&h).await;

    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH1".into(),
            app_args: vec![],
        })
        .await;

    tokio::time::advance(Duration::from_secs(3)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.engine.hangup_calls.lock().unwrap().as_slice(), &["CH1".to_string()]);
}

#[tokio::test]
async fn client_reject_is_idempotent_and_second_call_404s() {
    let h = build_harness();
    seed_push_target(&h).await;

    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH1".into(),
            app_args: vec![],
        })
        .await;

    let channel_index: models::ChannelIndex = h
        .kv
        .get_json(&kv_store::channel_key("CH1"))
        .await
        .unwrap()
        .expect("channel index written");
    let call: models::Call = call_key_for_test(&h, &channel_index.endpoint_id).await;

    h.orchestrator.end_call(&call.call_token).await.unwrap();
    assert_eq!(h.engine.hangup_calls.lock().unwrap().as_slice(), &["CH1".to_string()]);

    let second = h.orchestrator.end_call(&call.call_token).await;
    assert!(matches!(second, Err(orchestrator::OrchestratorError::NotFound)));
    // Hangup was not issued a second time.
    assert_eq!(h.engine.hangup_calls.lock().unwrap().len(), 1);
}

/// A bridged outbound leg must be hung up and the bridge itself deleted on
/// explicit end, not just the doorphone channel — otherwise the mixing
/// bridge (and any joined client leg) leaks on the engine forever.
#[tokio::test]
async fn explicit_end_hangs_up_the_joined_outbound_leg_and_deletes_the_bridge() {
    let h = build_harness();
    seed_push_target(&h).await;

    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH1".into(),
            app_args: vec![],
        })
        .await;

    let bridge_id = h.engine.bridges_created.lock().unwrap()[0].clone();

    let channel_index: models::ChannelIndex = h
        .kv
        .get_json(&kv_store::channel_key("CH1"))
        .await
        .unwrap()
        .expect("channel index written");
    let call: models::Call = call_key_for_test(&h, &channel_index.endpoint_id).await;
    assert_eq!(call.bridge_id.as_deref(), Some(bridge_id.as_str()));

    // Outbound leg joins the bridge alongside the doorphone channel.
    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH2".into(),
            app_args: vec!["outgoing".into(), bridge_id.clone()],
        })
        .await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    h.orchestrator.end_call(&call.call_token).await.unwrap();

    let hangups = h.engine.hangup_calls.lock().unwrap();
    assert!(hangups.contains(&"CH1".to_string()));
    assert!(hangups.contains(&"CH2".to_string()));
    assert_eq!(h.engine.delete_bridge_calls.lock().unwrap().as_slice(), &[bridge_id]);
}

/// Test-only helper: the call token isn't handed back directly by
/// `handle_event`, so scan KV via the channel index's endpoint id (the
/// endpoint index carries the token) to recover it for assertions.
async fn call_key_for_test(h: &Harness, endpoint_id: &str) -> models::Call {
    let endpoint_index: models::EndpointIndex = h
        .kv
        .get_json(&kv_store::endpoint_key(endpoint_id))
        .await
        .unwrap()
        .expect("endpoint index written");
    h.kv
        .get_json(&call_key(&endpoint_index.token))
        .await
        .unwrap()
        .expect("call record written")
}

#[tokio::test]
async fn duplicate_originate_triggers_are_deduped_by_the_pending_record() {
    let h = build_harness();
    seed_push_target(&h).await;

    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH1".into(),
            app_args: vec![],
        })
        .await;

    let channel_index: models::ChannelIndex = h
        .kv
        .get_json(&kv_store::channel_key("CH1"))
        .await
        .unwrap()
        .expect("channel index written");
    let endpoint_id = channel_index.endpoint_id.clone();

    // Two near-simultaneous state-change events...
    h.orchestrator
        .handle_event(EngineEvent::EndpointStateChanged {
            endpoint_id: endpoint_id.clone(),
            state: "online".into(),
        })
        .await;
    h.orchestrator
        .handle_event(EngineEvent::EndpointStateChanged {
            endpoint_id: endpoint_id.clone(),
            state: "online".into(),
        })
        .await;

    // ...plus a fallback poller tick.
    orchestrator::pending_originate_retry(&h.orchestrator).await.unwrap();

    assert_eq!(h.engine.originate_calls.lock().unwrap().len(), 1);
}

/// Same race as above but driven through real concurrency instead of
/// sequential `.await`s, matching how `main.rs` actually dispatches events
/// (each on its own spawned task). The lease is consumed by an atomic
/// get-and-delete, so this must still originate exactly once.
#[tokio::test]
async fn concurrent_state_change_and_poller_tick_still_originate_exactly_once() {
    let h = build_harness();
    seed_push_target(&h).await;

    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH1".into(),
            app_args: vec![],
        })
        .await;

    let channel_index: models::ChannelIndex = h
        .kv
        .get_json(&kv_store::channel_key("CH1"))
        .await
        .unwrap()
        .expect("channel index written");
    let endpoint_id = channel_index.endpoint_id.clone();

    let first = h.orchestrator.handle_event(EngineEvent::EndpointStateChanged {
        endpoint_id: endpoint_id.clone(),
        state: "online".into(),
    });
    let second = h.orchestrator.handle_event(EngineEvent::EndpointStateChanged {
        endpoint_id: endpoint_id.clone(),
        state: "online".into(),
    });
    let third = orchestrator::pending_originate_retry(&h.orchestrator);

    let (_, _, retry_result) = tokio::join!(first, second, third);
    retry_result.unwrap();

    assert_eq!(h.engine.originate_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn engine_unreachable_during_setup_sends_no_push_and_leaves_no_pending_originate() {
    let h = build_harness();
    seed_push_target(&h).await;
    h.engine.fail_create_bridge.store(true, Ordering::SeqCst);

    h.orchestrator
        .handle_event(EngineEvent::ChannelEnteredApp {
            channel_id: "CH1".into(),
            app_args: vec![],
        })
        .await;

    // The KV index records are written before the bridge is created,
    // so `call:`/`channel:`/`endpoint:` still exist — harmless, since no push
    // went out and nothing will ever resolve the pending originate.
    assert_eq!(h.push.sent.lock().unwrap().len(), 0);
    assert_eq!(h.engine.bridges_created.lock().unwrap().len(), 0);

    let channel_index: models::ChannelIndex = h
        .kv
        .get_json(&kv_store::channel_key("CH1"))
        .await
        .unwrap()
        .expect("KV index records are written before bridge creation is attempted");

    let pending: Option<models::PendingOriginate> =
        h.kv.get_json(&originate_key(&channel_index.endpoint_id)).await.unwrap();
    assert!(pending.is_none(), "no pending-originate record should exist when bridge creation never succeeded");
}

#[tokio::test]
async fn outgoing_credentials_mint_and_cleanup_round_trip() {
    let h = build_harness();

    let minted = h.orchestrator.mint_outgoing_credentials().await.unwrap();
    assert!(minted.credentials.username.starts_with("out_"));

    h.orchestrator.cleanup_outgoing(&minted.outgoing_token).await.unwrap();

    let second = h.orchestrator.cleanup_outgoing(&minted.outgoing_token).await;
    assert!(matches!(second, Err(orchestrator::OrchestratorError::NotFound)));
}
