//! filesync: one-way directory synchronization over TCP
//!
//! A server watches directories and pushes every change to the whitelisted
//! clients that are currently sending heartbeats. Clients that come back
//! online get a full-tree resync.

pub mod agent;
pub mod checksum;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod fs_enum;
pub mod heartbeat;
pub mod logger;
pub mod path_map;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod resync;
pub mod server;
pub mod watch;
