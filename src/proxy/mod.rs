//! Reverse proxy functionality
//!
//! This module implements the core reverse proxy logic: the backend
//! contract, round-robin selection over a fixed registry, request dispatch,
//! and forwarding to upstream servers.

pub mod backend;
pub mod front_door;
pub mod registry;
pub mod upstream;

pub use backend::{Backend, HttpBackend};
pub use front_door::FrontDoor;
pub use registry::{Registry, Selection};
pub use upstream::Upstream;
