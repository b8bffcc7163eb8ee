//! PortLink core: transport-free protocol primitives, error types, and the
//! security/validation layer.
//!
//! This crate defines the envelope wire contract, the origin allow-list and
//! payload sanitizer, and the structural schema validator shared by the engine
//! and any embedding code. It intentionally carries no runtime dependencies so
//! it can be reused outside the tokio engine.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Inbound traffic arrives from a shared primitive that other, unrelated code
//! may also use; every classifier in this crate reports malformed input as a
//! value ("not protocol traffic") rather than an error or a panic.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod envelope;
pub mod error;
pub mod schema;
pub mod security;

/// Shared result type.
pub use error::{ErrorCode, PortLinkError, Result};
