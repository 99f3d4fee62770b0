//! Corsair Protocol Buffers
//!
//! Generated protobuf code for the Corsair operator gRPC API.
//!
//! This crate contains:
//! - `OperatorService` for session lookup, task execution and the event stream
//! - the `Spite` payload envelope and the operation-specific bodies it carries

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod methods;

/// Corsair v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("corsair.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;
