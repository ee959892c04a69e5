use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use habitat_storage::{MemoryStore, PgStore, PostgrestConfig, PostgrestStore, Store};
use thiserror::Error;
use tracing::info;

pub const SUPABASE_URL_ENV: &str = "NEXT_PUBLIC_SUPABASE_URL";
pub const SUPABASE_KEY_ENV: &str = "SUPABASE_SERVICE_ROLE_KEY";
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Supabase,
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supabase" | "postgrest" => Ok(Self::Supabase),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("expected supabase, postgres, or memory, got {other}")),
        }
    }
}

/// Connection details for the selected backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Supabase { url: String, service_role_key: String },
    Postgres { database_url: String },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateConfig {
    pub store: StoreTarget,
    pub data_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub write_concurrency: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value,
        }),
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    lookup(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingEnv(name))
}

impl MigrateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = parse_var(&lookup, "HABITAT_STORE", StoreBackend::Supabase)?;
        let store = match backend {
            StoreBackend::Supabase => StoreTarget::Supabase {
                url: required(&lookup, SUPABASE_URL_ENV)?,
                service_role_key: required(&lookup, SUPABASE_KEY_ENV)?,
            },
            StoreBackend::Postgres => StoreTarget::Postgres {
                database_url: required(&lookup, DATABASE_URL_ENV)?,
            },
            StoreBackend::Memory => StoreTarget::Memory,
        };

        let write_concurrency = parse_var(&lookup, "HABITAT_WRITE_CONCURRENCY", 1usize)?;
        if write_concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "HABITAT_WRITE_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            store,
            data_dir: lookup("HABITAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            rules_dir: lookup("HABITAT_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./rules")),
            write_concurrency,
            http_timeout_secs: parse_var(&lookup, "HABITAT_HTTP_TIMEOUT_SECS", 30u64)?,
            user_agent: lookup("HABITAT_USER_AGENT").unwrap_or_else(|| "habitat-migrate/0.1".to_string()),
        })
    }

    pub fn backend(&self) -> StoreBackend {
        match self.store {
            StoreTarget::Supabase { .. } => StoreBackend::Supabase,
            StoreTarget::Postgres { .. } => StoreBackend::Postgres,
            StoreTarget::Memory => StoreBackend::Memory,
        }
    }
}

pub async fn build_store(config: &MigrateConfig) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match &config.store {
        StoreTarget::Supabase {
            url,
            service_role_key,
        } => Arc::new(PostgrestStore::new(PostgrestConfig {
            base_url: url.clone(),
            service_role_key: service_role_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?),
        StoreTarget::Postgres { database_url } => {
            let store = PgStore::connect(database_url, config.write_concurrency.max(1) as u32 + 1).await?;
            store.apply_schema().await?;
            Arc::new(store)
        }
        StoreTarget::Memory => Arc::new(MemoryStore::new()),
    };
    info!(backend = ?config.backend(), "target store ready");
    Ok(store)
}
