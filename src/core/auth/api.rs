//! Auth API endpoints
//!
//! Provides REST API endpoints for session management:
//! - GET  /health              - Store connectivity
//! - POST /auth/login          - Verify credentials and get tokens
//! - POST /auth/validate       - Validate a token (header or body)
//! - POST /auth/refresh        - Mint a new access token
//! - POST /auth/logout         - Revoke a token (header or body)
//! - POST /auth/logout-all     - Revoke every token of the bearer's subject
//! - GET  /auth/user-info      - Subject behind an access token
//!
//! Every route is also served under `/api`.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::auth::authority::TokenPair;
use crate::core::auth::jwt::Claims;
use crate::core::auth::service::{
    AuthError, HealthReport, LoginRequest, RefreshRequest, SessionService, UserInfo,
};

/// Auth API state containing the session service
#[derive(Clone)]
pub struct AuthApiState {
    pub session_service: SessionService,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

/// Convert AuthError to API response
impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN"),
            AuthError::MissingToken => (StatusCode::BAD_REQUEST, "MISSING_TOKEN"),
            AuthError::Unauthenticated => (StatusCode::UNAUTHORIZED, "MISSING_TOKEN"),
            AuthError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AuthError::StoreUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
            AuthError::CredentialServiceUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "CREDENTIALS_UNAVAILABLE")
            }
            AuthError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        // Internal details stay in the logs
        let message = match &self {
            AuthError::InternalError(_) => "Internal error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ApiError::new(message, code))).into_response()
    }
}

/// Response for a successful login
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub token_type: String,
}

impl From<TokenPair> for LoginResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            success: true,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_in: pair.expires_in,
            token_type: pair.token_type,
        }
    }
}

/// Response for token validation
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Claims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for token refresh
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub success: bool,
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Response for logout
#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
    pub message: String,
}

/// Response for logout-all
#[derive(Debug, Serialize)]
pub struct LogoutAllResponse {
    pub success: bool,
    pub revoked: usize,
}

/// Response for user-info
#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    pub success: bool,
    pub user: UserInfo,
}

/// Body accepted by endpoints that take a token outside the header
#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub token: Option<String>,
}

/// Create the auth API router
pub fn auth_api_router(state: AuthApiState) -> Router {
    let state = Arc::new(state);

    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/validate", post(validate_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/logout-all", post(logout_all_handler))
        .route("/auth/user-info", get(user_info_handler));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .with_state(state)
}

/// Auth router wrapped in CORS and request tracing
pub fn app_router(state: AuthApiState, allowed_origins: &[String]) -> Router {
    auth_api_router(state)
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}

/// CORS for the configured browser origins. Unparseable origins are skipped;
/// `*` allows any origin but then credentials are not allowed.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    base.allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

/// GET /health
/// Always 200; a store outage shows up as `degraded`
async fn health_handler(State(state): State<Arc<AuthApiState>>) -> Json<HealthReport> {
    Json(state.session_service.health().await)
}

/// POST /auth/login
/// Verify credentials and get access/refresh tokens
async fn login_handler(
    State(state): State<Arc<AuthApiState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AuthError> {
    tracing::info!(username = %request.username, "Login attempt");

    let tokens = state.session_service.login(request).await?;

    Ok(Json(tokens.into()))
}

/// POST /auth/validate
/// Validate a token from the Authorization header or the `token` field
async fn validate_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, AuthError> {
    let token = token_from_header_or_body(&headers, body)?;

    match state.session_service.validate(&token).await {
        Ok(claims) => Ok(Json(ValidateResponse {
            valid: true,
            payload: Some(claims),
            error: None,
        })
        .into_response()),
        Err(AuthError::InvalidToken) => Ok((
            StatusCode::UNAUTHORIZED,
            Json(ValidateResponse {
                valid: false,
                payload: None,
                error: Some(AuthError::InvalidToken.to_string()),
            }),
        )
            .into_response()),
        Err(e) => Err(e),
    }
}

/// POST /auth/refresh
/// Mint a new access token using a refresh token
async fn refresh_handler(
    State(state): State<Arc<AuthApiState>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AuthError> {
    tracing::debug!("Token refresh request");

    let refreshed = state.session_service.refresh(request).await?;

    Ok(Json(RefreshResponse {
        success: true,
        access_token: refreshed.access_token,
        expires_in: refreshed.expires_in,
        token_type: "Bearer".to_string(),
        refresh_token: refreshed.refresh_token,
    }))
}

/// POST /auth/logout
/// Revoke the token from the Authorization header or the `token` field
async fn logout_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Response, AuthError> {
    let token = token_from_header_or_body(&headers, body)?;

    if state.session_service.logout(&token).await? {
        Ok(Json(LogoutResponse {
            success: true,
            message: "Token revoked".to_string(),
        })
        .into_response())
    } else {
        Ok((
            StatusCode::BAD_REQUEST,
            Json(LogoutResponse {
                success: false,
                message: "Token could not be revoked".to_string(),
            }),
        )
            .into_response())
    }
}

/// POST /auth/logout-all
/// Revoke every token of the bearer's subject
async fn logout_all_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
) -> Result<Json<LogoutAllResponse>, AuthError> {
    let token = extract_bearer_token(&headers).ok_or(AuthError::Unauthenticated)?;

    let revoked = state.session_service.logout_all(&token).await?;

    Ok(Json(LogoutAllResponse {
        success: true,
        revoked,
    }))
}

/// GET /auth/user-info
/// Get subject info from an access token
async fn user_info_handler(
    State(state): State<Arc<AuthApiState>>,
    headers: HeaderMap,
) -> Result<Json<UserInfoResponse>, AuthError> {
    let token = extract_bearer_token(&headers).ok_or(AuthError::Unauthenticated)?;

    let user = state.session_service.user_info(&token).await?;

    Ok(Json(UserInfoResponse {
        success: true,
        user,
    }))
}

/// Extract Bearer token from Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;

    let token = auth_header.strip_prefix("Bearer ")?.trim();

    if token.is_empty() {
        return None;
    }

    Some(token.to_string())
}

/// Header first, then the JSON body's `token` field
fn token_from_header_or_body(
    headers: &HeaderMap,
    body: Option<Json<Value>>,
) -> Result<String, AuthError> {
    if let Some(token) = extract_bearer_token(headers) {
        return Ok(token);
    }

    body.and_then(|Json(value)| serde_json::from_value::<TokenRequest>(value).ok())
        .and_then(|request| request.token)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::auth::authority::{AuthoritySettings, TokenAuthority};
    use crate::core::auth::credentials::{CredentialError, CredentialStore, VerifiedSubject};
    use crate::core::auth::jwt::{JwtConfig, JwtService};
    use crate::core::store::MemoryStore;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    struct AcceptAll;

    #[async_trait]
    impl CredentialStore for AcceptAll {
        async fn verify(
            &self,
            _username: &str,
            _password: &str,
        ) -> Result<VerifiedSubject, CredentialError> {
            Ok(VerifiedSubject::default())
        }
    }

    fn test_router() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let jwt = JwtService::new(JwtConfig::new("test_secret_key_for_testing_only")).unwrap();
        let authority = TokenAuthority::new(jwt, store.clone(), AuthoritySettings::default());
        let state = AuthApiState {
            session_service: SessionService::new(authority, Arc::new(AcceptAll)),
        };
        (auth_api_router(state), store)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn login(router: &Router) -> (String, String) {
        let (status, body) = send(
            router,
            post_json(
                "/auth/login",
                serde_json::json!({"username": "ana", "password": "pw", "subject_id": "42"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        (
            body["access_token"].as_str().unwrap().to_string(),
            body["refresh_token"].as_str().unwrap().to_string(),
        )
    }

    // ========================================================================
    // Bearer Extraction Tests
    // ========================================================================

    #[test]
    fn test_extract_bearer_token_valid() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer my_token_123"),
        );

        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("my_token_123"));
    }

    #[test]
    fn test_extract_bearer_token_missing_or_malformed() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_none());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic base64credentials"),
        );
        assert!(extract_bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(extract_bearer_token(&headers).is_none());
    }

    #[test]
    fn test_header_beats_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from_header"),
        );
        let body = Some(Json(serde_json::json!({"token": "from_body"})));

        assert_eq!(
            token_from_header_or_body(&headers, body).unwrap(),
            "from_header"
        );
    }

    #[test]
    fn test_body_token_fallback() {
        let headers = HeaderMap::new();
        let body = Some(Json(serde_json::json!({"token": "from_body"})));
        assert_eq!(
            token_from_header_or_body(&headers, body).unwrap(),
            "from_body"
        );

        assert!(matches!(
            token_from_header_or_body(&headers, None),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn test_api_error_serialization() {
        let error = ApiError::new("Something went wrong", "ERROR_CODE");
        let json = serde_json::to_string(&error).unwrap();

        assert!(json.contains("Something went wrong"));
        assert!(json.contains("ERROR_CODE"));
    }

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (AuthError::InvalidCredentials, StatusCode::UNAUTHORIZED),
            (AuthError::InvalidToken, StatusCode::UNAUTHORIZED),
            (AuthError::MissingToken, StatusCode::BAD_REQUEST),
            (AuthError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AuthError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AuthError::StoreUnavailable, StatusCode::SERVICE_UNAVAILABLE),
            (
                AuthError::CredentialServiceUnavailable,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AuthError::InternalError("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    // ========================================================================
    // Router Tests
    // ========================================================================

    #[tokio::test]
    async fn test_login_and_user_info() {
        let (router, _) = test_router();
        let (access, _) = login(&router).await;

        let request = Request::get("/auth/user-info")
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["user_id"], "42");
        assert_eq!(body["user"]["role"], "user");
    }

    #[tokio::test]
    async fn test_routes_also_under_api_prefix() {
        let (router, _) = test_router();
        let request = Request::get("/api/health").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_login_bad_request() {
        let (router, _) = test_router();
        let (status, body) = send(
            &router,
            post_json("/auth/login", serde_json::json!({"username": "ana"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_validate_via_body_and_invalid() {
        let (router, _) = test_router();
        let (access, _) = login(&router).await;

        let (status, body) = send(
            &router,
            post_json("/auth/validate", serde_json::json!({"token": access})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
        assert_eq!(body["payload"]["user_id"], "42");
        assert_eq!(body["payload"]["type"], "access");

        let (status, body) = send(
            &router,
            post_json("/auth/validate", serde_json::json!({"token": "garbage"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["valid"], false);
    }

    #[tokio::test]
    async fn test_validate_missing_token() {
        let (router, _) = test_router();
        let request = Request::post("/auth/validate").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_TOKEN");
    }

    #[tokio::test]
    async fn test_user_info_without_header() {
        let (router, _) = test_router();
        let request = Request::get("/auth/user-info").body(Body::empty()).unwrap();
        let (status, _) = send(&router, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logout_then_second_logout_fails() {
        let (router, _) = test_router();
        let (access, _) = login(&router).await;

        let logout = || {
            Request::post("/auth/logout")
                .header(header::AUTHORIZATION, format!("Bearer {access}"))
                .body(Body::empty())
                .unwrap()
        };

        let (status, body) = send(&router, logout()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = send(&router, logout()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_refresh_endpoint() {
        let (router, _) = test_router();
        let (access, refresh) = login(&router).await;

        let (status, body) = send(
            &router,
            post_json("/auth/refresh", serde_json::json!({"refresh_token": refresh})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_type"], "Bearer");
        assert_ne!(body["access_token"], access.as_str());
        assert!(body.get("refresh_token").is_none());

        let (status, _) = send(
            &router,
            post_json("/auth/refresh", serde_json::json!({"refresh_token": access})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_store_outage_is_503() {
        let (router, store) = test_router();
        let (access, _) = login(&router).await;
        store.set_available(false);

        let (status, body) = send(
            &router,
            post_json("/auth/validate", serde_json::json!({"token": access})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "STORE_UNAVAILABLE");

        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["store"], "disconnected");
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let (router, _) = test_router();
        let router = router.layer(cors_layer(&[
            "http://localhost:5173".to_string(),
            "bad\norigin".to_string(),
        ]));

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/auth/login")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
    }

    #[test]
    fn test_cors_wildcard_is_usable() {
        // Wildcard with credentials would panic when layered
        let (router, _) = test_router();
        let _ = router.layer(cors_layer(&["*".to_string()]));
    }
}
