use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Decoded application-start / application-end / endpoint-state-change
/// events. Anything else arriving on the socket is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ChannelEnteredApp {
        channel_id: String,
        app_args: Vec<String>,
    },
    ChannelLeftApp {
        channel_id: String,
    },
    EndpointStateChanged {
        endpoint_id: String,
        state: String,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<RawChannel>,
    #[serde(default)]
    endpoint: Option<RawEndpoint>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    #[serde(rename = "dialplan")]
    dialplan: Option<RawDialplan>,
}

#[derive(Debug, Deserialize)]
struct RawDialplan {
    #[serde(default)]
    app_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    resource: String,
    state: String,
}

fn decode(raw: &str) -> Option<EngineEvent> {
    let parsed: RawEvent = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(err) => {
            tracing::debug!(error = %err, "dropping malformed engine event");
            return None;
        }
    };

    match parsed.kind.as_str() {
        "StasisStart" => {
            let channel = parsed.channel?;
            let app_args = channel.dialplan.map(|d| d.app_args).unwrap_or_default();
            Some(EngineEvent::ChannelEnteredApp {
                channel_id: channel.id,
                app_args,
            })
        }
        "StasisEnd" => Some(EngineEvent::ChannelLeftApp {
            channel_id: parsed.channel?.id,
        }),
        "EndpointStateChange" => {
            let endpoint = parsed.endpoint?;
            Some(EngineEvent::EndpointStateChanged {
                endpoint_id: endpoint.resource,
                state: endpoint.state,
            })
        }
        other => {
            tracing::debug!(kind = other, "dropping unrecognized engine event kind");
            None
        }
    }
}

/// Handle to the background reconnect-and-dispatch task. Dropping it does
/// not stop the task; call [`EventStreamHandle::stop`] for that.
pub struct EventStreamHandle {
    task: JoinHandle<()>,
}

impl EventStreamHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Connects to the engine's event-stream WebSocket and invokes `handler` for
/// every decoded event. The socket is self-healing: on close or error it
/// reconnects with exponential backoff (base 1s, cap 30s); the first
/// successful post-reconnect event resets the backoff. Unbounded in
/// attempts, bounded in rate.
pub fn connect_events<F>(ws_url: String, user: String, password: String, handler: F) -> EventStreamHandle
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    // Shared with `run_once` so a message received mid-connection can reset
    // it directly, instead of the reset only ever happening on a clean
    // `Message::Close` in this outer loop.
    let backoff_millis = Arc::new(AtomicU64::new(INITIAL_BACKOFF.as_millis() as u64));
    let task = tokio::spawn(async move {
        loop {
            if let Err(err) = run_once(&ws_url, &user, &password, handler.as_ref(), &backoff_millis).await {
                let backoff = Duration::from_millis(backoff_millis.load(Ordering::SeqCst));
                tracing::warn!(error = %err, backoff_secs = backoff.as_secs(), "engine event stream dropped, reconnecting");
            }
            let backoff = Duration::from_millis(backoff_millis.load(Ordering::SeqCst));
            tokio::time::sleep(backoff).await;
            let next = (backoff * 2).min(MAX_BACKOFF);
            backoff_millis.store(next.as_millis() as u64, Ordering::SeqCst);
        }
    });
    EventStreamHandle { task }
}

async fn run_once<F>(ws_url: &str, user: &str, password: &str, handler: &F, backoff_millis: &AtomicU64) -> Result<(), String>
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    let mut request = ws_url.into_client_request().map_err(|e| e.to_string())?;
    let credentials = format!("{user}:{password}");
    let header_value = format!("Basic {}", BASE64.encode(credentials.as_bytes()));
    request
        .headers_mut()
        .insert(AUTHORIZATION, header_value.parse().map_err(|_| "invalid auth header".to_string())?);

    let (ws_stream, _) = tokio_tungstenite::connect_async(request).await.map_err(|e| e.to_string())?;
    let (_write, mut read) = ws_stream.split();

    while let Some(message) = read.next().await {
        let message = message.map_err(|e| e.to_string())?;
        match message {
            Message::Text(text) => {
                // Any successfully-read frame, not just a decodable one,
                // proves the connection is healthy again.
                backoff_millis.store(INITIAL_BACKOFF.as_millis() as u64, Ordering::SeqCst);
                if let Some(event) = decode(&text) {
                    handler(event);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stasis_start_with_app_args() {
        let raw = r#"{"type":"StasisStart","channel":{"id":"CH1","dialplan":{"app_args":["outgoing","B1"]}}}"#;
        assert_eq!(
            decode(raw),
            Some(EngineEvent::ChannelEnteredApp {
                channel_id: "CH1".into(),
                app_args: vec!["outgoing".into(), "B1".into()],
            })
        );
    }

    #[test]
    fn decodes_stasis_start_with_no_args() {
        let raw = r#"{"type":"StasisStart","channel":{"id":"CH1"}}"#;
        assert_eq!(
            decode(raw),
            Some(EngineEvent::ChannelEnteredApp {
                channel_id: "CH1".into(),
                app_args: vec![],
            })
        );
    }

    #[test]
    fn decodes_stasis_end() {
        let raw = r#"{"type":"StasisEnd","channel":{"id":"CH1"}}"#;
        assert_eq!(decode(raw), Some(EngineEvent::ChannelLeftApp { channel_id: "CH1".into() }));
    }

    #[test]
    fn decodes_endpoint_state_change() {
        let raw = r#"{"type":"EndpointStateChange","endpoint":{"resource":"tmp_1","state":"online"}}"#;
        assert_eq!(
            decode(raw),
            Some(EngineEvent::EndpointStateChanged {
                endpoint_id: "tmp_1".into(),
                state: "online".into(),
            })
        );
    }

    #[test]
    fn drops_unrecognized_event_kinds() {
        let raw = r#"{"type":"SomethingElse"}"#;
        assert_eq!(decode(raw), None);
    }

    #[test]
    fn drops_malformed_json() {
        assert_eq!(decode("not json"), None);
    }

    #[test]
    fn base64_matches_known_vector() {
        assert_eq!(BASE64.encode(b"user:pass"), "dXNlcjpwYXNz");
    }
}
