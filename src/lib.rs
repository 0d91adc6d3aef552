//! Session Authority - bearer token issue, validation and revocation
//!
//! A stateless HTTP service that mints signed access/refresh tokens and keeps
//! their liveness in a shared TTL store, so any replica can validate or revoke
//! a token before it naturally expires.

pub mod core;
