//! Durable realtime config store: the SQL rows the telephony engine
//! polls directly to authenticate dynamic SIP endpoints, plus the push-token
//! registry. Backed by Postgres via `sqlx` in production; orchestrator tests
//! run against [`InMemoryRealtimeStore`].

use async_trait::async_trait;
use models::{Call, CallState, EphemeralEndpointSpec, PushPlatform, PushTarget, TEMPLATE_CLIENT, TEMPLATE_DOMOPHONE};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("realtime store error: {0}")]
    Sql(#[from] sqlx::Error),
}

#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    async fn ensure_templates(&self) -> Result<(), StoreError>;
    async fn create_ephemeral_endpoint(&self, spec: &EphemeralEndpointSpec) -> Result<(), StoreError>;
    async fn delete_ephemeral_endpoint(&self, id: &str) -> Result<(), StoreError>;
    async fn list_ephemeral_endpoints(&self) -> Result<Vec<String>, StoreError>;
    async fn ensure_user(&self, id: &str) -> Result<(), StoreError>;
    async fn save_push_token(&self, target: &PushTarget) -> Result<(), StoreError>;
    async fn list_push_tokens(&self, user_id: &str) -> Result<Vec<PushTarget>, StoreError>;
    /// Durable audit row for a freshly created call (never read back by the
    /// orchestrator's hot path — KV is the only source of truth for live
    /// state).
    async fn record_call(&self, call: &Call) -> Result<(), StoreError>;
    /// Updates the audit row's state on any transition, in particular the
    /// terminal ones (ended, timed out, failed).
    async fn update_call_state(&self, call_id: &str, state: CallState) -> Result<(), StoreError>;
}

fn call_state_str(state: CallState) -> &'static str {
    match state {
        CallState::Pending => "pending",
        CallState::Ringing => "ringing",
        CallState::Bridged => "bridged",
        CallState::Ended => "ended",
        CallState::TimedOut => "timed_out",
        CallState::Failed => "failed",
    }
}

/// Postgres-backed implementation.
pub struct PgRealtimeStore {
    pool: Pool<Postgres>,
}

impl PgRealtimeStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        tracing::info!("connected to postgres realtime store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl RealtimeStore for PgRealtimeStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (id TEXT PRIMARY KEY)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS push_tokens (
                id SERIAL PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                token TEXT NOT NULL,
                platform TEXT NOT NULL,
                device_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE(user_id, token)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ps_aors (id TEXT PRIMARY KEY, max_contacts INT NOT NULL, contact TEXT)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ps_auths (id TEXT PRIMARY KEY, auth_type TEXT NOT NULL, username TEXT NOT NULL, password TEXT NOT NULL)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ps_endpoints (
                id TEXT PRIMARY KEY,
                transport TEXT,
                aors TEXT,
                auth TEXT,
                context TEXT,
                disallow TEXT,
                allow TEXT,
                mailboxes TEXT,
                templates TEXT,
                direct_media BOOLEAN,
                force_rport BOOLEAN,
                rewrite_contact BOOLEAN,
                rtp_symmetric BOOLEAN
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                call_token TEXT NOT NULL,
                channel_id TEXT,
                endpoint_id TEXT,
                state TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ensure_templates(&self) -> Result<(), StoreError> {
        for (id, allow) in [(TEMPLATE_DOMOPHONE, "alaw,ulaw"), (TEMPLATE_CLIENT, "opus,alaw,ulaw")] {
            sqlx::query(
                r#"
                INSERT INTO ps_endpoints (id, transport, allow, disallow, templates)
                VALUES ($1, 'transport-udp', $2, 'all', $1)
                ON CONFLICT (id) DO UPDATE SET allow = EXCLUDED.allow
                "#,
            )
            .bind(id)
            .bind(allow)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn create_ephemeral_endpoint(&self, spec: &EphemeralEndpointSpec) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ps_aors (id, max_contacts, contact)
            VALUES ($1, 1, NULL)
            ON CONFLICT (id) DO UPDATE SET max_contacts = EXCLUDED.max_contacts
            "#,
        )
        .bind(&spec.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ps_auths (id, auth_type, username, password)
            VALUES ($1, 'userpass', $2, $3)
            ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username, password = EXCLUDED.password
            "#,
        )
        .bind(&spec.id)
        .bind(&spec.username)
        .bind(&spec.password)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO ps_endpoints (id, transport, aors, auth, context, disallow, allow, templates)
            VALUES ($1, 'transport-udp', $1, $1, $2, 'all', NULL, $3)
            ON CONFLICT (id) DO UPDATE SET context = EXCLUDED.context, templates = EXCLUDED.templates
            "#,
        )
        .bind(&spec.id)
        .bind(&spec.context)
        .bind(&spec.template_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_ephemeral_endpoint(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM ps_endpoints WHERE id = $1").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM ps_auths WHERE id = $1").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM ps_aors WHERE id = $1").bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_ephemeral_endpoints(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT id FROM ps_endpoints WHERE id LIKE 'tmp\_%' ESCAPE '\' OR id LIKE 'out\_%' ESCAPE '\'"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn ensure_user(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_push_token(&self, target: &PushTarget) -> Result<(), StoreError> {
        let platform = match target.platform {
            PushPlatform::Ios => "ios",
            PushPlatform::Android => "android",
        };
        sqlx::query(
            r#"
            INSERT INTO push_tokens (user_id, token, platform, device_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, token) DO UPDATE SET
                platform = EXCLUDED.platform, device_id = EXCLUDED.device_id, updated_at = now()
            "#,
        )
        .bind(&target.user_id)
        .bind(&target.token)
        .bind(platform)
        .bind(&target.device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_push_tokens(&self, user_id: &str) -> Result<Vec<PushTarget>, StoreError> {
        let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"SELECT user_id, token, platform, device_id FROM push_tokens WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, token, platform, device_id)| PushTarget {
                user_id,
                token,
                platform: if platform == "ios" { PushPlatform::Ios } else { PushPlatform::Android },
                device_id,
            })
            .collect())
    }

    async fn record_call(&self, call: &Call) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO calls (id, call_token, channel_id, endpoint_id, state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(&call.call_id)
        .bind(&call.call_token)
        .bind(&call.channel_id)
        .bind(&call.endpoint_id)
        .bind(call_state_str(call.state))
        .bind(call.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_call_state(&self, call_id: &str, state: CallState) -> Result<(), StoreError> {
        sqlx::query("UPDATE calls SET state = $1 WHERE id = $2")
            .bind(call_state_str(state))
            .bind(call_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-process fake used by orchestrator tests (no live Postgres available in
/// this environment).
#[derive(Default)]
pub struct InMemoryRealtimeStore {
    endpoints: Mutex<HashSet<String>>,
    users: Mutex<HashSet<String>>,
    push_tokens: Mutex<Vec<PushTarget>>,
    call_states: Mutex<std::collections::HashMap<String, CallState>>,
}

impl InMemoryRealtimeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RealtimeStore for InMemoryRealtimeStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ensure_templates(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_ephemeral_endpoint(&self, spec: &EphemeralEndpointSpec) -> Result<(), StoreError> {
        self.endpoints.lock().unwrap().insert(spec.id.clone());
        Ok(())
    }

    async fn delete_ephemeral_endpoint(&self, id: &str) -> Result<(), StoreError> {
        self.endpoints.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_ephemeral_endpoints(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.endpoints.lock().unwrap().iter().cloned().collect())
    }

    async fn ensure_user(&self, id: &str) -> Result<(), StoreError> {
        self.users.lock().unwrap().insert(id.to_string());
        Ok(())
    }

    async fn save_push_token(&self, target: &PushTarget) -> Result<(), StoreError> {
        let mut tokens = self.push_tokens.lock().unwrap();
        tokens.retain(|t| !(t.user_id == target.user_id && t.token == target.token));
        tokens.push(target.clone());
        Ok(())
    }

    async fn list_push_tokens(&self, user_id: &str) -> Result<Vec<PushTarget>, StoreError> {
        Ok(self
            .push_tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn record_call(&self, call: &Call) -> Result<(), StoreError> {
        self.call_states.lock().unwrap().insert(call.call_id.clone(), call.state);
        Ok(())
    }

    async fn update_call_state(&self, call_id: &str, state: CallState) -> Result<(), StoreError> {
        self.call_states.lock().unwrap().insert(call_id.to_string(), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::EphemeralEndpointSpec;

    fn spec(id: &str) -> EphemeralEndpointSpec {
        EphemeralEndpointSpec {
            id: id.to_string(),
            username: id.to_string(),
            password: "secretsecret".to_string(),
            context: "from-intercom".to_string(),
            template_id: "tpl_domophone".to_string(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = InMemoryRealtimeStore::new();
        store.create_ephemeral_endpoint(&spec("tmp_1")).await.unwrap();
        store.create_ephemeral_endpoint(&spec("tmp_1")).await.unwrap();
        assert_eq!(store.list_ephemeral_endpoints().await.unwrap(), vec!["tmp_1".to_string()]);
    }

    #[tokio::test]
    async fn delete_missing_id_is_safe() {
        let store = InMemoryRealtimeStore::new();
        store.delete_ephemeral_endpoint("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn push_tokens_unique_on_user_and_token() {
        let store = InMemoryRealtimeStore::new();
        let target = PushTarget {
            user_id: "101".into(),
            token: "abc".into(),
            platform: PushPlatform::Ios,
            device_id: None,
        };
        store.save_push_token(&target).await.unwrap();
        store.save_push_token(&target).await.unwrap();
        assert_eq!(store.list_push_tokens("101").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn call_audit_row_transitions_to_terminal_state() {
        let store = InMemoryRealtimeStore::new();
        let call = Call {
            call_id: "call-1".into(),
            call_token: "tok".into(),
            channel_id: "CH1".into(),
            endpoint_id: "tmp_1".into(),
            bridge_id: None,
            state: CallState::Pending,
            credentials: models::SipCredentials {
                username: "tmp_1".into(),
                password: "secretsecret".into(),
                domain: "intercom.example".into(),
            },
            created_at: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into(),
            ends_not_before: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:30Z").unwrap().into(),
        };
        store.record_call(&call).await.unwrap();
        assert_eq!(store.call_states.lock().unwrap().get("call-1"), Some(&CallState::Pending));

        store.update_call_state("call-1", CallState::Ended).await.unwrap();
        assert_eq!(store.call_states.lock().unwrap().get("call-1"), Some(&CallState::Ended));
    }
}
