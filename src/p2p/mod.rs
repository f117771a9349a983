//! Peer-to-peer rendezvous: the server's room table, and the client's loop that negotiates and
//! races direct connections to the other member of its room.

pub mod portmap;
pub mod punch;
pub mod rendezvous;
pub mod rooms;

pub use portmap::PortMapper;
pub use rendezvous::Rendezvous;
