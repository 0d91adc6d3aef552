//! External credential verification
//!
//! Identity is owned elsewhere; this module only asks "is this username and
//! password right, and who is it?". Two backends are provided:
//!
//! - `HttpCredentialStore` calls the identity service's `/login` endpoint
//! - `StaticCredentialStore` checks bcrypt hashes loaded from a JSON file

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::jwt::{AttributeValue, Attributes};

const DEFAULT_CREDENTIAL_TIMEOUT_SECS: u64 = 5;

/// Credential verification errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credentials rejected")]
    Rejected,

    #[error("Credential service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid credential configuration: {0}")]
    Config(String),
}

/// What the identity source knows about a verified user. Every field is
/// optional; the caller fills gaps from the login request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifiedSubject {
    pub subject_id: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub attributes: Attributes,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, username: &str, password: &str)
    -> Result<VerifiedSubject, CredentialError>;
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    user: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Identity service reachable over HTTP
#[derive(Clone)]
pub struct HttpCredentialStore {
    client: reqwest::Client,
    login_url: String,
}

impl HttpCredentialStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CredentialError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(CredentialError::Config(format!(
                "credential service URL must be http(s): {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| CredentialError::Config(e.to_string()))?;

        Ok(Self {
            client,
            login_url: format!("{base_url}/login"),
        })
    }
}

/// Map the identity service's user record onto a verified subject. Known
/// identity fields are lifted out; remaining scalar fields become attributes.
fn subject_from_user(user: serde_json::Map<String, serde_json::Value>) -> VerifiedSubject {
    let mut subject = VerifiedSubject::default();

    for (key, value) in user {
        let text = match &value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        };

        match key.as_str() {
            "id" | "user_id" | "subject_id" if subject.subject_id.is_none() => {
                subject.subject_id = text;
            }
            "username" | "name" | "display_name" if subject.display_name.is_none() => {
                subject.display_name = text;
            }
            "role" | "rol" => subject.role = text,
            "password" | "password_hash" => {}
            _ => {
                if let Some(scalar) = AttributeValue::from_json(&value) {
                    subject.attributes.insert(key, scalar);
                }
            }
        }
    }

    subject
}

#[async_trait]
impl CredentialStore for HttpCredentialStore {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<VerifiedSubject, CredentialError> {
        let response = self
            .client
            .post(&self.login_url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Credential service request failed");
                CredentialError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CredentialError::Unavailable(format!(
                "credential service returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(CredentialError::Rejected);
        }

        let reply: LoginReply = response
            .json()
            .await
            .map_err(|e| CredentialError::Unavailable(format!("malformed reply: {e}")))?;

        if !reply.success {
            return Err(CredentialError::Rejected);
        }

        Ok(reply.user.map(subject_from_user).unwrap_or_default())
    }
}

// ============================================================================
// Static backend
// ============================================================================

/// One account of the static credential file
#[derive(Debug, Clone, Deserialize)]
pub struct StaticAccount {
    pub username: String,
    /// bcrypt hash
    pub password_hash: String,
    pub subject_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Accounts with bcrypt password hashes, held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    accounts: HashMap<String, StaticAccount>,
}

impl StaticCredentialStore {
    pub fn new(accounts: Vec<StaticAccount>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.username.clone(), account))
                .collect(),
        }
    }

    /// Load a JSON array of accounts
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CredentialError::Config(format!("{}: {e}", path.display())))?;
        let accounts: Vec<StaticAccount> = serde_json::from_str(&raw)
            .map_err(|e| CredentialError::Config(format!("{}: {e}", path.display())))?;
        Ok(Self::new(accounts))
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<VerifiedSubject, CredentialError> {
        let account = self
            .accounts
            .get(username)
            .ok_or(CredentialError::Rejected)?;

        let valid = bcrypt::verify(password, &account.password_hash).map_err(|e| {
            tracing::error!(username, error = %e, "Stored password hash is unreadable");
            CredentialError::Rejected
        })?;
        if !valid {
            return Err(CredentialError::Rejected);
        }

        Ok(VerifiedSubject {
            subject_id: Some(account.subject_id.clone()),
            display_name: account.display_name.clone(),
            role: account.role.clone(),
            attributes: account.attributes.clone(),
        })
    }
}

/// Credential backend selection
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialConfig {
    Http { url: String, timeout_secs: u64 },
    File { path: String },
}

impl CredentialConfig {
    /// `CREDENTIAL_SERVICE_URL` (+ `CREDENTIAL_TIMEOUT_SECS`) or `CREDENTIALS_FILE`
    pub fn from_env() -> Result<Self, CredentialError> {
        if let Ok(url) = std::env::var("CREDENTIAL_SERVICE_URL")
            && !url.trim().is_empty()
        {
            let timeout_secs = match std::env::var("CREDENTIAL_TIMEOUT_SECS") {
                Ok(v) => v.trim().parse().map_err(|_| {
                    CredentialError::Config("CREDENTIAL_TIMEOUT_SECS must be a number".into())
                })?,
                Err(_) => DEFAULT_CREDENTIAL_TIMEOUT_SECS,
            };
            return Ok(CredentialConfig::Http {
                url: url.trim().to_string(),
                timeout_secs,
            });
        }

        if let Ok(path) = std::env::var("CREDENTIALS_FILE")
            && !path.trim().is_empty()
        {
            return Ok(CredentialConfig::File {
                path: path.trim().to_string(),
            });
        }

        Err(CredentialError::Config(
            "set CREDENTIAL_SERVICE_URL or CREDENTIALS_FILE".into(),
        ))
    }

    /// Build the configured backend
    pub fn build(&self) -> Result<std::sync::Arc<dyn CredentialStore>, CredentialError> {
        match self {
            CredentialConfig::Http { url, timeout_secs } => Ok(std::sync::Arc::new(
                HttpCredentialStore::new(url, Duration::from_secs((*timeout_secs).max(1)))?,
            )),
            CredentialConfig::File { path } => {
                let store = StaticCredentialStore::from_file(path)?;
                tracing::info!(accounts = store.len(), "Loaded static credentials");
                Ok(std::sync::Arc::new(store))
            }
        }
    }
}
