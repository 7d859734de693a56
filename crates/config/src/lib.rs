//! Process-wide configuration, loaded once at startup from the
//! environment and validated before anything else runs. There is no file
//! config and no hot reload — a bad or missing value is a startup failure,
//! not a runtime one.

use std::env::VarError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("environment variable {name} has an invalid value {value:?}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub app_name: String,
}

impl EngineConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/ari", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ari/events?app={}", self.host, self.port, self.app_name)
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}", self.host, self.port)
        } else {
            format!("redis://:{}@{}:{}", self.password, self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub password: String,
}

impl PostgresConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.db
        )
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_domain: String,
    pub server_ip: String,
    pub engine: EngineConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub call_token_ttl_sec: u64,
    pub ring_timeout_sec: u64,
    pub app_port: u16,
    pub realphone: String,
    pub push_access_token: Option<String>,
    pub push_vendor_url: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        Ok(_) | Err(VarError::NotPresent) => Err(ConfigError::MissingVar(name)),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidVar {
            name,
            value: "<non-utf8>".into(),
            reason: "not valid unicode".into(),
        }),
    }
}

fn required_parsed<T: std::str::FromStr>(name: &'static str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = required(name)?;
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
        name,
        value: raw,
        reason: e.to_string(),
    })
}

impl AppConfig {
    /// Load and validate configuration from the process environment. Fails
    /// fast on the first missing required value or failed invariant.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = AppConfig {
            server_domain: required("SERVER_DOMAIN")?,
            server_ip: required("SERVER_IP")?,
            engine: EngineConfig {
                host: required("ARI_HOST")?,
                port: required_parsed("ARI_PORT")?,
                user: required("ARI_USER")?,
                password: required("ARI_PASSWORD")?,
                app_name: required("ARI_APP_NAME")?,
            },
            redis: RedisConfig {
                host: required("REDIS_HOST")?,
                port: required_parsed("REDIS_PORT")?,
                password: std::env::var("REDIS_PASSWORD").unwrap_or_default(),
            },
            postgres: PostgresConfig {
                host: required("POSTGRES_HOST")?,
                port: required_parsed("POSTGRES_PORT")?,
                db: required("POSTGRES_DB")?,
                user: required("POSTGRES_USER")?,
                password: required("POSTGRES_PASSWORD")?,
            },
            call_token_ttl_sec: required_parsed("CALL_TOKEN_TTL_SEC")?,
            ring_timeout_sec: required_parsed("RING_TIMEOUT_SEC")?,
            app_port: required_parsed("APP_PORT")?,
            realphone: required("REALPHONE")?,
            push_access_token: std::env::var("PUSH_ACCESS_TOKEN").ok().filter(|s| !s.is_empty()),
            push_vendor_url: required("PUSH_VENDOR_URL")?,
        };

        cfg.validate()?;

        if cfg.push_access_token.is_none() {
            tracing::warn!("PUSH_ACCESS_TOKEN not set; push requests will be sent unauthenticated");
        }

        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_timeout_sec > self.call_token_ttl_sec {
            return Err(ConfigError::Invalid(format!(
                "ringTimeoutSec ({}) must be <= callTokenTtlSec ({}): a ring timer firing after the KV records it depends on have expired would race a late client against already-gone state",
                self.ring_timeout_sec, self.call_token_ttl_sec
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_engine() -> EngineConfig {
        EngineConfig {
            host: "engine".into(),
            port: 8088,
            user: "u".into(),
            password: "p".into(),
            app_name: "intercom".into(),
        }
    }

    fn base_cfg(call_token_ttl_sec: u64, ring_timeout_sec: u64) -> AppConfig {
        AppConfig {
            server_domain: "intercom.example".into(),
            server_ip: "10.0.0.1".into(),
            engine: base_engine(),
            redis: RedisConfig {
                host: "redis".into(),
                port: 6379,
                password: String::new(),
            },
            postgres: PostgresConfig {
                host: "pg".into(),
                port: 5432,
                db: "intercom".into(),
                user: "intercom".into(),
                password: "secret".into(),
            },
            call_token_ttl_sec,
            ring_timeout_sec,
            app_port: 8080,
            realphone: "101".into(),
            push_access_token: None,
            push_vendor_url: "https://push.example/send".into(),
        }
    }

    #[test]
    fn ring_timeout_equal_to_ttl_is_valid() {
        assert!(base_cfg(30, 30).validate().is_ok());
    }

    #[test]
    fn ring_timeout_greater_than_ttl_is_rejected() {
        let err = base_cfg(20, 30).validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn engine_urls_never_embed_credentials() {
        let engine = base_engine();
        assert!(!engine.base_url().contains('@'));
        assert!(!engine.ws_url().contains('@'));
    }

    #[test]
    fn redis_url_omits_colon_when_password_empty() {
        let redis = RedisConfig {
            host: "redis".into(),
            port: 6379,
            password: String::new(),
        };
        assert_eq!(redis.url(), "redis://redis:6379");
    }
}
