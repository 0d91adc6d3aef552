//! Core session authority: shared store, token lifecycle and HTTP surface

pub mod auth;
pub mod config;
pub mod store;
