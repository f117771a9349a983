//! Multiplexed, encrypted tunnels between clients and servers.
//!
//! Clients keep pools of sessions ([`channel`]) towards one or more servers, each session a
//! transport connection ([`transport`]) multiplexed into many streams ([`mux`]) and opened with an
//! authentication exchange that rekeys it ([`auth`]). Servers relay every stream to its target,
//! possibly through further hops ([`dispatch`]). Two clients sharing a room token can also reach
//! each other directly ([`p2p`]).

pub mod auth;
pub mod channel;
pub mod cipher;
pub mod client;
pub mod codec;
pub mod compress;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mux;
pub mod p2p;
pub mod ratelimit;
pub mod relay;
pub mod server;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
