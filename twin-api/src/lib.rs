//! Shared types and client interfaces for the twind control plane.
//!
//! This crate holds everything the daemon and its surfaces need to
//! agree on: device addressing and values, the twin state records,
//! overrides, functional systems, the common error type, and the
//! request channel used to talk to the core task.

pub mod client;
pub mod service;
pub mod types;

/// A `Result` type where the error value is a value from
/// `twin_api::types::Error`.

pub type Result<T> = std::result::Result<T, types::Error>;
