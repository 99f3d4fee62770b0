//! Cross-component tests for the operator client.
//!
//! - `harness.rs`   - in-memory teamserver and a wired client fixture
//! - `scenarios.rs` - end-to-end flows across registry, stream, correlator,
//!   hooks and the function bridge

pub(crate) mod harness;
