//! Wire messages exchanged over multiplexed snova sessions.
//!
//! Every message travels inside a length-prefixed frame (see [`message`]). The first stream of a
//! session carries the [`auth`] exchange, every later stream starts with a
//! [`StreamRequest`](connect::StreamRequest) tag.

pub mod auth;
pub mod connect;
pub mod message;
pub mod methods;
pub mod serialize;
