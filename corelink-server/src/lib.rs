//! # corelink-server
//!
//! Multi-transport server for corelink.
//!
//! This crate provides:
//! - TCP, WebSocket and UDP listeners sharing one packet pipeline
//! - Operator routing keyed by CRC32-IEEE with middleware chains
//! - Per-request contexts with transport-specific reply sinks
//! - A pluggable pub/sub broker (in-memory implementation included)
//! - A retry store for fire-once resends of unacknowledged pushes
//! - Builder-style runtime options plus YAML/env file configuration

pub mod broker;
pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod retry;
pub mod router;
pub mod server;
mod tcp;
mod udp;
mod websocket;

pub use broker::{Broker, MemoryBroker, MessageHandler};
pub use config::{Config, ConfigError};
pub use context::{Context, ReplySink, INTERNAL_ERROR_KEY, NODE_ID_KEY};
pub use error::ServerError;
pub use retry::{RetryItem, RetryStore};
pub use router::{Handler, Middleware, Router};
pub use server::{Server, ServerConfig, ServerStats};
