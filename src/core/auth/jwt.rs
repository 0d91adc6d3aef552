//! JWT utilities for token signing and verification
//!
//! Tokens are signed with a shared HMAC secret. Access tokens live for an hour
//! by default, refresh tokens for seven days. Signature validity alone never
//! makes a token valid; the authority also checks the liveness record.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default access token lifetime (1 hour)
const ACCESS_TOKEN_TTL_SECS: u64 = 3600;

/// Default refresh token lifetime (7 days)
const REFRESH_TOKEN_TTL_SECS: u64 = 604_800;

const DEFAULT_ALGORITHM: &str = "HS256";
const DEFAULT_ISSUER: &str = "session-authority";

/// JWT configuration
#[derive(Clone)]
pub struct JwtConfig {
    /// Shared signing secret
    pub secret: String,
    /// HMAC algorithm name (HS256, HS384 or HS512)
    pub algorithm: String,
    /// Access token lifetime in seconds
    pub access_ttl_secs: u64,
    /// Refresh token lifetime in seconds
    pub refresh_ttl_secs: u64,
    /// Token issuer
    pub issuer: String,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl JwtConfig {
    /// Create a new JWT configuration with default lifetimes
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            algorithm: DEFAULT_ALGORITHM.to_string(),
            access_ttl_secs: ACCESS_TOKEN_TTL_SECS,
            refresh_ttl_secs: REFRESH_TOKEN_TTL_SECS,
            issuer: DEFAULT_ISSUER.to_string(),
        }
    }

    /// Create config from environment variables
    ///
    /// `JWT_SECRET_KEY` (or `JWT_SECRET`) is required; `JWT_ALGORITHM`,
    /// `ACCESS_TOKEN_EXPIRY`, `REFRESH_TOKEN_EXPIRY` and `JWT_ISSUER` are optional.
    pub fn from_env() -> Result<Self, JwtError> {
        let secret = std::env::var("JWT_SECRET_KEY")
            .or_else(|_| std::env::var("JWT_SECRET"))
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(JwtError::MissingSecret)?;

        let algorithm =
            std::env::var("JWT_ALGORITHM").unwrap_or_else(|_| DEFAULT_ALGORITHM.to_string());

        let access_ttl = parse_ttl("ACCESS_TOKEN_EXPIRY", ACCESS_TOKEN_TTL_SECS)?;
        let refresh_ttl = parse_ttl("REFRESH_TOKEN_EXPIRY", REFRESH_TOKEN_TTL_SECS)?;

        let issuer = std::env::var("JWT_ISSUER").unwrap_or_else(|_| DEFAULT_ISSUER.to_string());

        Ok(Self {
            secret,
            algorithm,
            access_ttl_secs: access_ttl,
            refresh_ttl_secs: refresh_ttl,
            issuer,
        })
    }

    /// Set access token lifetime
    pub fn access_ttl(mut self, secs: u64) -> Self {
        self.access_ttl_secs = secs;
        self
    }

    /// Set refresh token lifetime
    pub fn refresh_ttl(mut self, secs: u64) -> Self {
        self.refresh_ttl_secs = secs;
        self
    }

    /// Set signing algorithm
    pub fn algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    /// Set issuer
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }
}

fn parse_ttl(name: &'static str, default: u64) -> Result<u64, JwtError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| JwtError::Config(format!("{name} must be a number of seconds"))),
        Err(_) => Ok(default),
    }
}

/// JWT errors
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JWT_SECRET_KEY environment variable not set")]
    MissingSecret,

    #[error("Invalid JWT configuration: {0}")]
    Config(String),

    #[error("Token encoding failed: {0}")]
    EncodingError(String),

    #[error("Token decoding failed: {0}")]
    DecodingError(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid token type")]
    InvalidTokenType,
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => JwtError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                JwtError::InvalidSignature
            }
            ErrorKind::InvalidToken
            | ErrorKind::InvalidIssuer
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => JwtError::InvalidToken,
            _ => JwtError::DecodingError(err.to_string()),
        }
    }
}

/// Token kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    /// Namespace prefix of this kind's liveness records
    pub fn key_prefix(self) -> &'static str {
        match self {
            TokenKind::Access => "access_token",
            TokenKind::Refresh => "refresh_token",
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// Scalar attribute carried through tokens
///
/// Deliberately closed: nested objects and arrays are not representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl AttributeValue {
    /// Convert a JSON value, rejecting arrays and objects
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(AttributeValue::Null),
            serde_json::Value::Bool(b) => Some(AttributeValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(AttributeValue::Int)
                .or_else(|| n.as_f64().map(AttributeValue::Float)),
            serde_json::Value::String(s) => Some(AttributeValue::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

/// Opaque subject metadata (linked record ids and the like)
pub type Attributes = BTreeMap<String, AttributeValue>;

/// JWT claims structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject id
    #[serde(rename = "user_id")]
    pub sub: String,
    /// Display name
    pub username: String,
    /// Role tag; older tokens may not carry one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Token kind (access or refresh)
    #[serde(rename = "type")]
    pub kind: TokenKind,
    /// Subject attributes
    #[serde(rename = "metadata", default)]
    pub attributes: Attributes,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Unique token id
    pub jti: String,
}

impl Claims {
    pub fn is_access_token(&self) -> bool {
        self.kind == TokenKind::Access
    }

    pub fn is_refresh_token(&self) -> bool {
        self.kind == TokenKind::Refresh
    }
}

/// JWT service for signing and verification
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    /// Create a new JWT service
    ///
    /// Fails on an empty secret, a non-HMAC algorithm or zero lifetimes, so a
    /// misconfigured process never starts serving.
    pub fn new(config: JwtConfig) -> Result<Self, JwtError> {
        if config.secret.is_empty() {
            return Err(JwtError::MissingSecret);
        }

        let algorithm = Algorithm::from_str(&config.algorithm.to_uppercase())
            .map_err(|_| JwtError::Config(format!("unknown algorithm {}", config.algorithm)))?;
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(JwtError::Config(format!(
                "{} is not an HMAC algorithm",
                config.algorithm
            )));
        }

        if config.access_ttl_secs == 0 || config.refresh_ttl_secs == 0 {
            return Err(JwtError::Config("token lifetimes must be positive".into()));
        }

        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        Ok(Self {
            config,
            algorithm,
            encoding_key,
            decoding_key,
        })
    }

    /// Create JWT service from environment variables
    pub fn from_env() -> Result<Self, JwtError> {
        Self::new(JwtConfig::from_env()?)
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.config.access_ttl_secs
    }

    pub fn refresh_ttl_secs(&self) -> u64 {
        self.config.refresh_ttl_secs
    }

    /// Lifetime of a token kind in seconds
    pub fn ttl_secs(&self, kind: TokenKind) -> u64 {
        match kind {
            TokenKind::Access => self.config.access_ttl_secs,
            TokenKind::Refresh => self.config.refresh_ttl_secs,
        }
    }

    /// Build claims for a new token of `kind`
    pub fn claims(
        &self,
        kind: TokenKind,
        subject_id: &str,
        username: &str,
        role: Option<&str>,
        attributes: &Attributes,
    ) -> Claims {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl_secs(kind)).unwrap_or(i64::MAX);

        Claims {
            sub: subject_id.to_string(),
            username: username.to_string(),
            role: role.map(str::to_string),
            kind,
            attributes: attributes.clone(),
            iat: now,
            exp: now.saturating_add(ttl),
            iss: self.config.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    /// Sign claims into a compact token
    pub fn sign(&self, claims: &Claims) -> Result<String, JwtError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| JwtError::EncodingError(e.to_string()))
    }

    fn validation(&self, check_expiry: bool) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        // Strict expiration checking
        validation.leeway = 0;
        validation.validate_exp = check_expiry;
        validation
    }

    /// Verify signature, issuer and expiry and decode the claims
    pub fn verify(&self, token: &str) -> Result<Claims, JwtError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation(true))?;
        Ok(data.claims)
    }

    /// Verify a token of a specific kind
    pub fn verify_kind(&self, token: &str, kind: TokenKind) -> Result<Claims, JwtError> {
        let claims = self.verify(token)?;
        if claims.kind != kind {
            return Err(JwtError::InvalidTokenType);
        }
        Ok(claims)
    }

    /// Verify the signature only; an elapsed `exp` is accepted
    pub fn decode_ignoring_expiry(&self, token: &str) -> Result<Claims, JwtError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation(false))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_service() -> JwtService {
        JwtService::new(JwtConfig::new("test_secret_key_for_testing_only_32bytes!")).unwrap()
    }

    fn sample_attributes() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("patient_id".into(), AttributeValue::Int(17));
        attributes.insert("clinic".into(), "north".into());
        attributes
    }

    fn signed(service: &JwtService, kind: TokenKind) -> (String, Claims) {
        let claims = service.claims(kind, "42", "ana", Some("patient"), &sample_attributes());
        (service.sign(&claims).unwrap(), claims)
    }

    // ========================================================================
    // JwtConfig Tests
    // ========================================================================

    #[test]
    fn test_jwt_config_new() {
        let config = JwtConfig::new("my_secret");

        assert_eq!(config.secret, "my_secret");
        assert_eq!(config.algorithm, "HS256");
        assert_eq!(config.access_ttl_secs, 3600);
        assert_eq!(config.refresh_ttl_secs, 604_800);
        assert_eq!(config.issuer, "session-authority");
    }

    #[test]
    fn test_jwt_config_builder() {
        let config = JwtConfig::new("secret")
            .access_ttl(60)
            .refresh_ttl(120)
            .algorithm("HS512")
            .issuer("clinic");

        assert_eq!(config.access_ttl_secs, 60);
        assert_eq!(config.refresh_ttl_secs, 120);
        assert_eq!(config.algorithm, "HS512");
        assert_eq!(config.issuer, "clinic");
    }

    #[test]
    fn test_jwt_config_debug_redacts_secret() {
        let config = JwtConfig::new("super-secret-value");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret-value"));
    }

    #[test]
    fn test_service_rejects_empty_secret() {
        assert!(matches!(
            JwtService::new(JwtConfig::new("")),
            Err(JwtError::MissingSecret)
        ));
    }

    #[test]
    fn test_service_rejects_asymmetric_algorithm() {
        let result = JwtService::new(JwtConfig::new("secret").algorithm("RS256"));
        assert!(matches!(result, Err(JwtError::Config(_))));

        let result = JwtService::new(JwtConfig::new("secret").algorithm("nonsense"));
        assert!(matches!(result, Err(JwtError::Config(_))));
    }

    #[test]
    fn test_service_accepts_lowercase_hmac() {
        assert!(JwtService::new(JwtConfig::new("secret").algorithm("hs384")).is_ok());
    }

    #[test]
    fn test_service_rejects_zero_ttl() {
        let result = JwtService::new(JwtConfig::new("secret").access_ttl(0));
        assert!(matches!(result, Err(JwtError::Config(_))));
    }

    // ========================================================================
    // Token Kind / Attribute Tests
    // ========================================================================

    #[test]
    fn test_token_kind_display_and_prefix() {
        assert_eq!(TokenKind::Access.to_string(), "access");
        assert_eq!(TokenKind::Refresh.to_string(), "refresh");
        assert_eq!(TokenKind::Access.key_prefix(), "access_token");
        assert_eq!(TokenKind::Refresh.key_prefix(), "refresh_token");
    }

    #[test]
    fn test_token_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&TokenKind::Access).unwrap(),
            r#""access""#
        );
        let refresh: TokenKind = serde_json::from_str(r#""refresh""#).unwrap();
        assert_eq!(refresh, TokenKind::Refresh);
    }

    #[test]
    fn test_attribute_value_from_json() {
        use serde_json::json;

        assert_eq!(
            AttributeValue::from_json(&json!(5)),
            Some(AttributeValue::Int(5))
        );
        assert_eq!(
            AttributeValue::from_json(&json!(1.5)),
            Some(AttributeValue::Float(1.5))
        );
        assert_eq!(
            AttributeValue::from_json(&json!("x")),
            Some(AttributeValue::Text("x".into()))
        );
        assert_eq!(AttributeValue::from_json(&json!([1, 2])), None);
        assert_eq!(AttributeValue::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_attributes_deserialize_untagged() {
        let attributes: Attributes =
            serde_json::from_str(r#"{"a": 1, "b": "two", "c": true, "d": null}"#).unwrap();

        assert_eq!(attributes["a"], AttributeValue::Int(1));
        assert_eq!(attributes["b"], AttributeValue::Text("two".into()));
        assert_eq!(attributes["c"], AttributeValue::Bool(true));
        assert_eq!(attributes["d"], AttributeValue::Null);
    }

    // ========================================================================
    // Sign / Verify Tests
    // ========================================================================

    #[test]
    fn test_sign_and_verify_access_token() {
        let service = create_test_service();
        let (token, claims) = signed(&service, TokenKind::Access);

        let decoded = service.verify(&token).unwrap();

        assert_eq!(decoded, claims);
        assert_eq!(decoded.sub, "42");
        assert_eq!(decoded.role.as_deref(), Some("patient"));
        assert!(decoded.is_access_token());
        assert_eq!(decoded.exp - decoded.iat, 3600);
    }

    #[test]
    fn test_refresh_token_lifetime() {
        let service = create_test_service();
        let (token, _) = signed(&service, TokenKind::Refresh);

        let decoded = service.verify(&token).unwrap();
        assert!(decoded.is_refresh_token());
        assert_eq!(decoded.exp - decoded.iat, 604_800);
    }

    #[test]
    fn test_verify_kind_mismatch() {
        let service = create_test_service();
        let (access, _) = signed(&service, TokenKind::Access);
        let (refresh, _) = signed(&service, TokenKind::Refresh);

        assert!(matches!(
            service.verify_kind(&access, TokenKind::Refresh),
            Err(JwtError::InvalidTokenType)
        ));
        assert!(matches!(
            service.verify_kind(&refresh, TokenKind::Access),
            Err(JwtError::InvalidTokenType)
        ));
        assert!(service.verify_kind(&refresh, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn test_verify_malformed_token() {
        let service = create_test_service();
        assert!(matches!(
            service.verify("invalid.token.here"),
            Err(JwtError::InvalidToken)
        ));
        assert!(service.verify("").is_err());
    }

    #[test]
    fn test_verify_wrong_secret() {
        let service1 = JwtService::new(JwtConfig::new("secret_one")).unwrap();
        let service2 = JwtService::new(JwtConfig::new("secret_two")).unwrap();

        let (token, _) = signed(&service1, TokenKind::Access);

        assert!(matches!(
            service2.verify(&token),
            Err(JwtError::InvalidSignature)
        ));
    }

    #[test]
    fn test_verify_wrong_issuer() {
        let service1 = JwtService::new(JwtConfig::new("shared").issuer("one")).unwrap();
        let service2 = JwtService::new(JwtConfig::new("shared").issuer("two")).unwrap();

        let (token, _) = signed(&service1, TokenKind::Access);
        assert!(matches!(service2.verify(&token), Err(JwtError::InvalidToken)));
    }

    #[test]
    fn test_unique_jti() {
        let service = create_test_service();
        let (token1, claims1) = signed(&service, TokenKind::Access);
        let (token2, claims2) = signed(&service, TokenKind::Access);

        assert_ne!(claims1.jti, claims2.jti);
        assert_ne!(token1, token2);
    }

    #[test]
    fn test_expired_token() {
        let service = create_test_service();
        let mut claims = service.claims(TokenKind::Access, "42", "ana", None, &Attributes::new());
        claims.iat -= 7200;
        claims.exp = claims.iat + 60;
        let token = service.sign(&claims).unwrap();

        let result = service.verify(&token);
        assert!(
            matches!(result, Err(JwtError::Expired)),
            "Expected Expired error, got: {:?}",
            result
        );

        // Revocation still needs to read expired tokens
        let decoded = service.decode_ignoring_expiry(&token).unwrap();
        assert_eq!(decoded.sub, "42");
    }

    #[test]
    fn test_decode_ignoring_expiry_still_checks_signature() {
        let service1 = JwtService::new(JwtConfig::new("secret_one")).unwrap();
        let service2 = JwtService::new(JwtConfig::new("secret_two")).unwrap();
        let (token, _) = signed(&service1, TokenKind::Access);

        assert!(service2.decode_ignoring_expiry(&token).is_err());
    }

    #[test]
    fn test_claims_wire_format() {
        let service = create_test_service();
        let (_, claims) = signed(&service, TokenKind::Access);

        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["user_id"], "42");
        assert_eq!(json["type"], "access");
        assert_eq!(json["metadata"]["patient_id"], 17);
        assert_eq!(json["role"], "patient");
    }

    #[test]
    fn test_claims_without_role_or_metadata() {
        let json = r#"{
            "user_id": "7",
            "username": "bo",
            "type": "refresh",
            "iat": 1,
            "exp": 2,
            "iss": "session-authority",
            "jti": "x"
        }"#;

        let claims: Claims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.role, None);
        assert!(claims.attributes.is_empty());
    }

    #[test]
    fn test_jwt_error_display() {
        assert_eq!(
            JwtError::MissingSecret.to_string(),
            "JWT_SECRET_KEY environment variable not set"
        );
        assert_eq!(JwtError::Expired.to_string(), "Token expired");
        assert_eq!(JwtError::InvalidToken.to_string(), "Invalid token");
        assert_eq!(JwtError::InvalidTokenType.to_string(), "Invalid token type");
    }
}
