//! Turnstile - round-robin reverse proxy
//!
//! Core library: HTTP transport, backend registry, selection and forwarding.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod server;
