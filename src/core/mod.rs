//! # Core Infrastructure Module
//!
//! Foundational pieces shared across the gateway, currently the HTTP
//! client factory.

pub mod http_client;

pub use http_client::{HttpClientBuilder, HttpClientConfig, HttpClientError};
