//! chanbus: realtime topic-based pub/sub over a single duplex WebSocket per
//! client, with multiplexed channels, reconciled presence, and cross-instance
//! relay through an external fabric (Redis pub/sub or streams).
//!
//! The crate ships both halves of the protocol: the server engine
//! ([`server::Engine`]) and its client mirror ([`client::Socket`]).

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod limits;
pub mod protocol;
pub mod server;

pub use client::{Channel, Socket, SocketOptions};
pub use protocol::{ChannelConfig, Frame};
pub use server::Engine;
