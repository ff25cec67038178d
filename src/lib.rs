//! Proxyhub - A multi-tenant reverse proxy
//!
//! This library provides named, lazily built reverse proxy instances that:
//! - Rewrite each request onto a configured upstream host, with per-path
//!   overrides (absolute URLs or replacement paths)
//! - Keep only allow-listed request and response headers
//! - Run user-supplied hooks on the outbound request and the upstream response
//! - Forward through a pluggable transport, pooled hyper connections by default
//! - Build at most one instance per configuration name, even under concurrent access

pub mod config;
pub mod error;
pub mod headers;
pub mod instance;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod transport;
