//! Token authority
//!
//! Owns every mutation of token liveness records and subject token indexes.
//! A token is valid only when its signature verifies AND its liveness record
//! is still present in the shared store, so tokens can be revoked before
//! their natural expiry.
//!
//! Store key layout:
//! - `access_token:{subject_id}:{token}`  -> token, TTL = access lifetime
//! - `refresh_token:{subject_id}:{token}` -> token, TTL = refresh lifetime
//! - `user_tokens:{subject_id}`           -> set of tokens, TTL = refresh lifetime
//! - `user_data:{subject_id}`             -> cached subject record (JSON)

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::jwt::{Attributes, Claims, JwtError, JwtService, TokenKind};
use crate::core::store::{SessionStore, StoreError};

/// Default lifetime of the cached subject record
const SUBJECT_DATA_TTL_SECS: u64 = 3600;

/// Role used when neither the token nor the cache carries one
const DEFAULT_ROLE: &str = "user";

/// Key of a token's liveness record
pub fn token_key(kind: TokenKind, subject_id: &str, token: &str) -> String {
    format!("{}:{}:{}", kind.key_prefix(), subject_id, token)
}

/// Key of a subject's token index
pub fn subject_index_key(subject_id: &str) -> String {
    format!("user_tokens:{}", subject_id)
}

/// Key of a subject's cached record
pub fn subject_data_key(subject_id: &str) -> String {
    format!("user_data:{}", subject_id)
}

/// The authenticated principal a token pair is minted for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: String,
    pub display_name: String,
    pub role: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Subject {
    pub fn new(
        subject_id: impl Into<String>,
        display_name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            role: role.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Cached subject record stored under `user_data:{subject_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubjectRecord {
    username: String,
    role: String,
    #[serde(default)]
    metadata: Attributes,
}

/// Freshly minted token pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
    /// Always "Bearer"
    pub token_type: String,
}

/// Result of a refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub expires_in: u64,
    /// Replacement refresh token, only under [`RefreshPolicy::Rotate`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// What happens to a refresh token when it is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// The refresh token stays live until it expires or is revoked
    #[default]
    Retain,
    /// The presented refresh token is revoked and a new one is issued
    Rotate,
}

/// Authority tuning beyond the signing configuration
#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    pub subject_data_ttl_secs: u64,
    pub refresh_policy: RefreshPolicy,
    pub default_role: String,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            subject_data_ttl_secs: SUBJECT_DATA_TTL_SECS,
            refresh_policy: RefreshPolicy::Retain,
            default_role: DEFAULT_ROLE.to_string(),
        }
    }
}

impl AuthoritySettings {
    /// `USER_DATA_EXPIRY` and `REFRESH_TOKEN_ROTATION`
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let subject_data_ttl_secs = match std::env::var("USER_DATA_EXPIRY") {
            Ok(v) => v
                .trim()
                .parse()
                .map_err(|_| "USER_DATA_EXPIRY must be a number of seconds".to_string())?,
            Err(_) => defaults.subject_data_ttl_secs,
        };

        let refresh_policy = match std::env::var("REFRESH_TOKEN_ROTATION")
            .map(|v| v.trim().to_lowercase())
            .as_deref()
        {
            Ok("true") | Ok("1") => RefreshPolicy::Rotate,
            Ok("false") | Ok("0") | Ok("") | Err(_) => RefreshPolicy::Retain,
            Ok(other) => return Err(format!("REFRESH_TOKEN_ROTATION: unexpected value {other}")),
        };

        Ok(Self {
            subject_data_ttl_secs,
            refresh_policy,
            ..defaults
        })
    }

    pub fn refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    pub fn subject_data_ttl(mut self, secs: u64) -> Self {
        self.subject_data_ttl_secs = secs;
        self
    }
}

/// Why a token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Malformed,
    BadSignature,
    Expired,
    WrongKind,
    /// Signature fine, but the liveness record is gone (revoked or TTL lapsed)
    NotLive,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            InvalidReason::Malformed => "malformed",
            InvalidReason::BadSignature => "bad signature",
            InvalidReason::Expired => "expired",
            InvalidReason::WrongKind => "wrong token kind",
            InvalidReason::NotLive => "revoked or expired",
        };
        write!(f, "{}", reason)
    }
}

/// Authority errors
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("Invalid token: {0}")]
    InvalidToken(InvalidReason),

    #[error("Session store unavailable: {0}")]
    StoreUnavailable(StoreError),

    #[error("Token signing failed: {0}")]
    Signing(JwtError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthorityError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            AuthorityError::StoreUnavailable(err)
        } else {
            AuthorityError::Internal(err.to_string())
        }
    }
}

impl From<JwtError> for AuthorityError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => AuthorityError::InvalidToken(InvalidReason::Expired),
            JwtError::InvalidSignature => AuthorityError::InvalidToken(InvalidReason::BadSignature),
            JwtError::InvalidTokenType => AuthorityError::InvalidToken(InvalidReason::WrongKind),
            JwtError::InvalidToken | JwtError::DecodingError(_) => {
                AuthorityError::InvalidToken(InvalidReason::Malformed)
            }
            JwtError::EncodingError(_) | JwtError::MissingSecret | JwtError::Config(_) => {
                AuthorityError::Signing(err)
            }
        }
    }
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Issues, validates, refreshes and revokes bearer tokens
#[derive(Clone)]
pub struct TokenAuthority {
    jwt: JwtService,
    store: Arc<dyn SessionStore>,
    settings: AuthoritySettings,
}

impl TokenAuthority {
    pub fn new(jwt: JwtService, store: Arc<dyn SessionStore>, settings: AuthoritySettings) -> Self {
        Self {
            jwt,
            store,
            settings,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    pub fn settings(&self) -> &AuthoritySettings {
        &self.settings
    }

    /// Sign a token and write its liveness record
    async fn mint(
        &self,
        kind: TokenKind,
        subject_id: &str,
        username: &str,
        role: &str,
        attributes: &Attributes,
    ) -> AuthorityResult<String> {
        let claims = self
            .jwt
            .claims(kind, subject_id, username, Some(role), attributes);
        let token = self.jwt.sign(&claims).map_err(|e| {
            tracing::error!(error = %e, "Token signing failed");
            AuthorityError::Signing(e)
        })?;

        self.store
            .put(
                &token_key(kind, subject_id, &token),
                &token,
                self.jwt.ttl_secs(kind),
            )
            .await?;

        Ok(token)
    }

    /// Add tokens to the subject index and stretch its TTL to the refresh lifetime
    async fn index(&self, subject_id: &str, tokens: Vec<String>) -> AuthorityResult<()> {
        let key = subject_index_key(subject_id);
        self.store.add_to_set(&key, &tokens).await?;
        self.store
            .set_ttl(&key, self.jwt.refresh_ttl_secs())
            .await?;
        Ok(())
    }

    /// Mint an access/refresh pair for an already authenticated subject
    pub async fn issue(&self, subject: &Subject) -> AuthorityResult<TokenPair> {
        let Subject {
            subject_id,
            display_name,
            role,
            attributes,
        } = subject;

        let access_token = self
            .mint(TokenKind::Access, subject_id, display_name, role, attributes)
            .await?;
        let refresh_token = self
            .mint(TokenKind::Refresh, subject_id, display_name, role, attributes)
            .await?;

        self.index(subject_id, vec![access_token.clone(), refresh_token.clone()])
            .await?;
        self.cache_subject(subject).await?;

        tracing::info!(subject_id = %subject_id, role = %role, "Issued token pair");

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.jwt.access_ttl_secs(),
            refresh_expires_in: self.jwt.refresh_ttl_secs(),
            token_type: "Bearer".to_string(),
        })
    }

    async fn cache_subject(&self, subject: &Subject) -> AuthorityResult<()> {
        let record = SubjectRecord {
            username: subject.display_name.clone(),
            role: subject.role.clone(),
            metadata: subject.attributes.clone(),
        };
        let json =
            serde_json::to_string(&record).map_err(|e| AuthorityError::Internal(e.to_string()))?;

        self.store
            .put(
                &subject_data_key(&subject.subject_id),
                &json,
                self.settings.subject_data_ttl_secs,
            )
            .await?;
        Ok(())
    }

    async fn cached_subject(&self, subject_id: &str) -> AuthorityResult<Option<SubjectRecord>> {
        let Some(raw) = self.store.get(&subject_data_key(subject_id)).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(subject_id, error = %e, "Ignoring unreadable subject record");
                Ok(None)
            }
        }
    }

    /// Check signature, then liveness. Returns the decoded claims.
    pub async fn validate(&self, token: &str) -> AuthorityResult<Claims> {
        let claims = self.jwt.verify(token).map_err(|e| {
            let err = AuthorityError::from(e);
            if let AuthorityError::InvalidToken(reason) = &err {
                tracing::warn!(%reason, "Token rejected");
            }
            err
        })?;

        let key = token_key(claims.kind, &claims.sub, token);
        if !self.store.exists(&key).await? {
            tracing::warn!(
                subject_id = %claims.sub,
                kind = %claims.kind,
                reason = %InvalidReason::NotLive,
                "Token rejected"
            );
            return Err(AuthorityError::InvalidToken(InvalidReason::NotLive));
        }

        Ok(claims)
    }

    /// Validate and require a specific kind
    pub async fn validate_kind(&self, token: &str, kind: TokenKind) -> AuthorityResult<Claims> {
        let claims = self.validate(token).await?;
        if claims.kind != kind {
            tracing::warn!(
                subject_id = %claims.sub,
                expected = %kind,
                actual = %claims.kind,
                "Token rejected"
            );
            return Err(AuthorityError::InvalidToken(InvalidReason::WrongKind));
        }
        Ok(claims)
    }

    /// Mint a new access token from a live refresh token
    ///
    /// Under [`RefreshPolicy::Retain`] the refresh token stays usable until it
    /// expires or is revoked. Under [`RefreshPolicy::Rotate`] it is revoked and
    /// a replacement is returned.
    pub async fn refresh(&self, refresh_token: &str) -> AuthorityResult<RefreshedTokens> {
        let claims = self.validate_kind(refresh_token, TokenKind::Refresh).await?;
        let subject_id = claims.sub.as_str();

        let (role, attributes) = match claims.role.clone() {
            Some(role) => (role, claims.attributes.clone()),
            None => match self.cached_subject(subject_id).await? {
                Some(record) => (record.role, record.metadata),
                None => (self.settings.default_role.clone(), claims.attributes.clone()),
            },
        };

        // Under rotation the presented token is consumed first; only the
        // caller whose delete removed the record may mint a replacement.
        if self.settings.refresh_policy == RefreshPolicy::Rotate {
            let consumed = self
                .store
                .delete(&token_key(TokenKind::Refresh, subject_id, refresh_token))
                .await?;
            if !consumed {
                tracing::warn!(
                    subject_id,
                    reason = %InvalidReason::NotLive,
                    "Refresh token already redeemed"
                );
                return Err(AuthorityError::InvalidToken(InvalidReason::NotLive));
            }
        }

        let access_token = self
            .mint(
                TokenKind::Access,
                subject_id,
                &claims.username,
                &role,
                &attributes,
            )
            .await?;

        let rotated = match self.settings.refresh_policy {
            RefreshPolicy::Retain => None,
            RefreshPolicy::Rotate => Some(
                self.mint(
                    TokenKind::Refresh,
                    subject_id,
                    &claims.username,
                    &role,
                    &attributes,
                )
                .await?,
            ),
        };

        let mut indexed = vec![access_token.clone()];
        indexed.extend(rotated.iter().cloned());
        self.index(subject_id, indexed).await?;

        tracing::info!(
            subject_id,
            rotated = rotated.is_some(),
            "Refreshed access token"
        );

        Ok(RefreshedTokens {
            access_token,
            expires_in: self.jwt.access_ttl_secs(),
            refresh_token: rotated,
        })
    }

    /// Remove a single token's liveness record
    ///
    /// An elapsed `exp` is accepted so late logouts still clean up. The
    /// subject index is left alone; stale members are harmless.
    pub async fn revoke(&self, token: &str) -> AuthorityResult<bool> {
        let claims = self.jwt.decode_ignoring_expiry(token)?;
        let removed = self
            .store
            .delete(&token_key(claims.kind, &claims.sub, token))
            .await?;

        if removed {
            tracing::info!(subject_id = %claims.sub, kind = %claims.kind, "Token revoked");
        } else {
            tracing::debug!(subject_id = %claims.sub, kind = %claims.kind, "Token already gone");
        }

        Ok(removed)
    }

    /// Revoke every token indexed for a subject ("log out everywhere").
    /// Returns the number of liveness records removed.
    pub async fn revoke_all(&self, subject_id: &str) -> AuthorityResult<usize> {
        let index_key = subject_index_key(subject_id);
        let tokens = self.store.members_of(&index_key).await?;

        let mut removed = 0;
        for token in &tokens {
            // The index does not record the kind; one of these is a no-op
            for kind in [TokenKind::Access, TokenKind::Refresh] {
                if self.store.delete(&token_key(kind, subject_id, token)).await? {
                    removed += 1;
                }
            }
        }

        self.store.delete(&index_key).await?;
        self.store.delete(&subject_data_key(subject_id)).await?;

        tracing::info!(subject_id, removed, "Revoked all tokens for subject");
        Ok(removed)
    }

    /// Store liveness for health reporting
    pub async fn store_healthy(&self) -> bool {
        self.store.ping().await
    }
}
