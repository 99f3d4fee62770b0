//! Corsair Operator Client Library
//!
//! Client side of the Corsair teamserver: session cache, event stream
//! demultiplexing, per-task callback correlation, event hooks and the
//! function bridge shared by the shell, scripting and tool-calling front ends.

pub mod bridge;
pub mod client;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod ops;
pub mod rpc;
pub mod script;
pub mod session;
pub mod shell;
pub mod tools;

#[cfg(test)]
mod tests;

pub use client::Client;
pub use error::{ClientError, ErrorKind, Result};
