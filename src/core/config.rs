//! Application configuration from environment variables.
//!
//! Load configuration using `Config::from_env()` after calling `dotenvy::dotenv()`.
//! A configuration error is fatal: the process refuses to start rather than
//! serve with a missing secret or an unreachable credential source.

use crate::core::auth::authority::AuthoritySettings;
use crate::core::auth::credentials::{CredentialConfig, CredentialError};
use crate::core::auth::jwt::{JwtConfig, JwtError};
use crate::core::store::StoreConfig;
use crate::core::store::redis_store::StoreConfigError;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8014;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:5173";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JWT configuration: {0}")]
    Jwt(#[from] JwtError),

    #[error("Store configuration: {0}")]
    Store(#[from] StoreConfigError),

    #[error("Credential configuration: {0}")]
    Credentials(#[from] CredentialError),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Which session store backs the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Redis,
    /// In-process; tokens do not survive restarts and are not shared
    Memory,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "redis" => Some(StoreBackend::Redis),
            "memory" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Browser origins allowed by CORS
    pub allowed_origins: Vec<String>,
    pub store_backend: StoreBackend,
    pub store: StoreConfig,
    pub jwt: JwtConfig,
    pub authority: AuthoritySettings,
    pub credentials: CredentialConfig,
}

/// Split a comma separated origin list, dropping blanks
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Call `dotenvy::dotenv()` before this to load from `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = match std::env::var("PORT") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name: "PORT", value })?,
            Err(_) => DEFAULT_PORT,
        };

        let allowed_origins = parse_origins(
            &std::env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.into()),
        );

        let store_backend = match std::env::var("SESSION_STORE") {
            Ok(value) => StoreBackend::parse(&value).ok_or(ConfigError::InvalidValue {
                name: "SESSION_STORE",
                value,
            })?,
            Err(_) => StoreBackend::default(),
        };

        let authority =
            AuthoritySettings::from_env().map_err(|value| ConfigError::InvalidValue {
                name: "authority settings",
                value,
            })?;

        Ok(Self {
            host,
            port,
            allowed_origins,
            store_backend,
            store: StoreConfig::from_env()?,
            jwt: JwtConfig::from_env()?,
            authority,
            credentials: CredentialConfig::from_env()?,
        })
    }

    /// `host:port` for the listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if the in-process store is selected
    pub fn uses_memory_store(&self) -> bool {
        self.store_backend == StoreBackend::Memory
    }
}
