//! Tunables for the node, with the customary NET/ROM defaults.
//!
//! The crate does not parse configuration files itself; the embedding
//! binary deserializes whatever format it likes into [`NetworkConfig`]
//! and hands it over at construction.

use serde::Deserialize;

/// Recommended values, matching what deployed NET/ROM nodes run with.
pub mod recommended {
    /// Seconds between NODES broadcasts.
    pub const NODES_INTERVAL: u64 = 300;
    /// Obsolescence assigned to a freshly heard route.
    pub const DEFAULT_OBS: i32 = 100;
    /// Quality assigned to a directly heard neighbor.
    pub const DEFAULT_QUALITY: u8 = 255;
    /// Routes at or below this quality are not worth keeping.
    pub const MIN_QUALITY: u8 = 50;
    /// Routes below this obsolescence are not advertised.
    pub const MIN_OBS: i32 = 4;
    /// AX.25 ack/retransmit timer, seconds.
    pub const T1: u64 = 4;
    /// AX.25 idle-probe timer, seconds.
    pub const T3: u64 = 300;
    /// AX.25 retry limit.
    pub const N2: u8 = 10;
    /// AX.25 outstanding I-frame window.
    pub const WINDOW_SIZE: u8 = 4;
    /// Bound on each device's L3 egress queue.
    pub const QUEUE_DEPTH: usize = 20;
    /// Initial TTL on NET/ROM packets we originate.
    pub const TTL: u8 = 7;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// This node's NET/ROM call, e.g. `N0CALL-9`.
    pub node_call: String,
    /// Up to six characters of node alias, e.g. `DAVID`.
    pub node_alias: String,
    /// Seconds between NODES broadcasts.
    pub nodes_interval: u64,
    pub default_obs: i32,
    pub default_quality: u8,
    pub min_quality: u8,
    pub min_obs: i32,
    /// T1 in seconds.
    pub t1: u64,
    /// T3 in seconds.
    pub t3: u64,
    /// Retry limit N2.
    pub n2: u8,
    /// Window size k.
    pub window_size: u8,
    pub queue_depth: usize,
    pub ttl: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            node_call: "N0CALL".into(),
            node_alias: "NOCALL".into(),
            nodes_interval: recommended::NODES_INTERVAL,
            default_obs: recommended::DEFAULT_OBS,
            default_quality: recommended::DEFAULT_QUALITY,
            min_quality: recommended::MIN_QUALITY,
            min_obs: recommended::MIN_OBS,
            t1: recommended::T1,
            t3: recommended::T3,
            n2: recommended::N2,
            window_size: recommended::WINDOW_SIZE,
            queue_depth: recommended::QUEUE_DEPTH,
            ttl: recommended::TTL,
        }
    }
}
