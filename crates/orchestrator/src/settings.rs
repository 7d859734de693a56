/// The subset of `AppConfig` the orchestrator core needs, decoupled from the
/// `config` crate so orchestrator tests don't have to construct a full
/// `AppConfig` (with its required env-var surface) just to build one.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub server_domain: String,
    pub call_token_ttl_sec: u64,
    pub ring_timeout_sec: u64,
    pub doorphone_context: String,
    pub client_context: String,
    /// The user id that receives doorphone push invites.
    pub push_recipient_user_id: String,
}
