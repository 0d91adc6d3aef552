//! Session service
//!
//! Business logic behind the HTTP surface: turns verified credentials into a
//! subject, and forwards token operations to the token authority.
//! Coordinates between the credential store and the authority.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::auth::authority::{
    AuthorityError, RefreshedTokens, Subject, TokenAuthority, TokenPair,
};
use crate::core::auth::credentials::{CredentialError, CredentialStore};
use crate::core::auth::jwt::{AttributeValue, Attributes, Claims, TokenKind};

/// Session service error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Token not provided")]
    MissingToken,

    #[error("Authorization header required")]
    Unauthenticated,

    #[error("{0}")]
    BadRequest(String),

    #[error("Session store unavailable")]
    StoreUnavailable,

    #[error("Credential service unavailable")]
    CredentialServiceUnavailable,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<AuthorityError> for AuthError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::InvalidToken(_) => AuthError::InvalidToken,
            AuthorityError::StoreUnavailable(e) => {
                tracing::error!(error = %e, "Session store unavailable");
                AuthError::StoreUnavailable
            }
            AuthorityError::Signing(e) => {
                tracing::error!(error = %e, "Token signing failed");
                AuthError::InternalError(e.to_string())
            }
            AuthorityError::Internal(msg) => {
                tracing::error!(error = %msg, "Token authority failure");
                AuthError::InternalError(msg)
            }
        }
    }
}

impl From<CredentialError> for AuthError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Rejected => AuthError::InvalidCredentials,
            CredentialError::Unavailable(msg) => {
                tracing::error!(error = %msg, "Credential service unavailable");
                AuthError::CredentialServiceUnavailable
            }
            CredentialError::Config(msg) => AuthError::InternalError(msg),
        }
    }
}

/// Login request data
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "user_id")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, alias = "metadata")]
    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Token refresh request
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: String,
}

/// Subject as reported by `user_info`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserInfo {
    pub user_id: String,
    pub username: String,
    pub role: Option<String>,
    pub attributes: Attributes,
}

impl From<Claims> for UserInfo {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
            attributes: claims.attributes,
        }
    }
}

/// Liveness summary for `/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store: &'static str,
    pub service: &'static str,
}

pub const SERVICE_NAME: &str = "session-authority";

/// Convert free-form JSON attributes into the scalar set tokens carry
fn scalar_attributes(
    raw: &serde_json::Map<String, serde_json::Value>,
) -> Result<Attributes, AuthError> {
    raw.iter()
        .map(|(key, value)| match AttributeValue::from_json(value) {
            Some(v) => Ok((key.clone(), v)),
            None => Err(AuthError::BadRequest(format!(
                "attribute {key} must be a string, number, boolean or null"
            ))),
        })
        .collect()
}

/// Session service
#[derive(Clone)]
pub struct SessionService {
    authority: TokenAuthority,
    credentials: Arc<dyn CredentialStore>,
}

impl SessionService {
    /// Create a new session service
    pub fn new(authority: TokenAuthority, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            authority,
            credentials,
        }
    }

    pub fn authority(&self) -> &TokenAuthority {
        &self.authority
    }

    /// Verify credentials and issue a token pair
    ///
    /// The verified record wins over whatever the caller claims; request
    /// fields only fill gaps the identity source left empty.
    pub async fn login(&self, request: LoginRequest) -> Result<TokenPair, AuthError> {
        let username = request.username.trim();
        if username.is_empty() || request.password.is_empty() {
            return Err(AuthError::BadRequest(
                "Username and password are required".to_string(),
            ));
        }

        let requested_attributes = match request.attributes.as_ref() {
            Some(raw) => scalar_attributes(raw)?,
            None => Attributes::new(),
        };

        let verified = self.credentials.verify(username, &request.password).await?;

        let subject_id = verified
            .subject_id
            .or(request.subject_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AuthError::BadRequest("subject_id is required".to_string()))?;

        let role = verified
            .role
            .or(request.role)
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.authority.settings().default_role.clone());

        let mut attributes = requested_attributes;
        attributes.extend(verified.attributes);

        let subject = Subject {
            subject_id,
            display_name: verified
                .display_name
                .unwrap_or_else(|| username.to_string()),
            role,
            attributes,
        };

        let tokens = self.authority.issue(&subject).await?;

        tracing::info!(
            subject_id = %subject.subject_id,
            role = %subject.role,
            "User logged in successfully"
        );

        Ok(tokens)
    }

    /// Validate a token of either kind
    pub async fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(self.authority.validate(token).await?)
    }

    /// Mint a new access token from a refresh token
    pub async fn refresh(&self, request: RefreshRequest) -> Result<RefreshedTokens, AuthError> {
        if request.refresh_token.is_empty() {
            return Err(AuthError::BadRequest("refresh_token is required".to_string()));
        }
        Ok(self.authority.refresh(&request.refresh_token).await?)
    }

    /// Revoke one token. Returns false when nothing was removed, including
    /// for tokens that do not verify at all.
    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        match self.authority.revoke(token).await {
            Ok(removed) => Ok(removed),
            Err(AuthorityError::InvalidToken(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Revoke every token of the access token's subject
    pub async fn logout_all(&self, access_token: &str) -> Result<usize, AuthError> {
        let claims = self
            .authority
            .validate_kind(access_token, TokenKind::Access)
            .await?;
        Ok(self.authority.revoke_all(&claims.sub).await?)
    }

    /// Get the subject behind an access token
    pub async fn user_info(&self, access_token: &str) -> Result<UserInfo, AuthError> {
        let claims = self
            .authority
            .validate_kind(access_token, TokenKind::Access)
            .await?;
        Ok(claims.into())
    }

    pub async fn health(&self) -> HealthReport {
        let healthy = self.authority.store_healthy().await;
        HealthReport {
            status: if healthy { "healthy" } else { "degraded" },
            store: if healthy { "connected" } else { "disconnected" },
            service: SERVICE_NAME,
        }
    }
}
