//! Channels: named pools of sessions to one or more servers, and the registry that owns them.

mod holder;
mod pool;
mod registry;

pub use holder::{HolderStat, SessionHolder};
pub use pool::{ChannelOptions, ChannelStat, ProxyChannel};
pub use registry::{Registry, REAPER_INTERVAL, STATS_LOG_INTERVAL};
