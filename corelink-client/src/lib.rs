//! # corelink-client
//!
//! Client library for corelink.
//!
//! This crate provides:
//! - A persistent TCP client multiplexing concurrent in-flight requests
//! - Reply correlation by operator and sequence
//! - Synchronous and asynchronous call styles with status callbacks
//! - Permanent message listeners for server-initiated pushes
//! - Heartbeats and transparent reconnection

pub mod callback;
pub mod client;
pub mod error;

pub use callback::{Reply, RequestStatusCallback};
pub use client::{Client, ClientConfig};
pub use error::ClientError;
