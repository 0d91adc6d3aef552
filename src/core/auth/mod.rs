//! Session authority
//!
//! This module provides token lifecycle functionality including:
//! - JWT signing and verification
//! - Token issue, validation, refresh and revocation against the shared store
//! - Credential verification against an external identity source
//! - REST API endpoints for session operations

pub mod api;
pub mod authority;
pub mod credentials;
pub mod jwt;
pub mod service;

pub use api::{AuthApiState, app_router, auth_api_router};
pub use authority::{
    AuthorityError, AuthoritySettings, InvalidReason, RefreshPolicy, RefreshedTokens, Subject,
    TokenAuthority, TokenPair,
};
pub use credentials::{
    CredentialConfig, CredentialError, CredentialStore, HttpCredentialStore,
    StaticCredentialStore, VerifiedSubject,
};
pub use jwt::{AttributeValue, Attributes, Claims, JwtConfig, JwtError, JwtService, TokenKind};
pub use service::{AuthError, LoginRequest, RefreshRequest, SessionService, UserInfo};
