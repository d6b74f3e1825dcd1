//! wisp-server library: the signaling server components.
//!
//! The binary is a thin wrapper; integration tests drive these types
//! directly.

pub mod config;
pub mod connection;
pub mod server;

pub use config::ServerConfig;
pub use connection::{ClientConnection, ConnectionHub};
pub use server::{HARD_LIMIT_FACTOR, SignalingServer};
