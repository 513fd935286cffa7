//! Canvaslink relay server.
//!
//! A rendezvous point for command traffic: a plugin-side client and an
//! automation client each `join` a named channel, after which frames
//! addressed to that channel are broadcast to the other member(s). The relay
//! holds no state beyond live channel membership; channels come into being
//! on first join and are destroyed once empty.

pub mod channels;
pub mod config;
pub mod connection;
pub mod server;

pub use channels::{ChannelRegistry, JoinOutcome};
pub use config::RelayConfig;
pub use server::{run, serve};
