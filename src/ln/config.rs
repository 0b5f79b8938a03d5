use std::path::PathBuf;

use clap_serde_derive::{
    clap::{self},
    ClapSerde,
};

/// Default relative locktime (in blocks) we impose on the peer's main
/// output.
pub const DEFAULT_LOCKTIME_BLOCKS: u32 = 144;

/// Maximum relative locktime we accept from a peer, about one week.
pub const DEFAULT_LOCKTIME_MAX: u32 = 1008;

/// Anchor confirmations we require before considering a channel usable.
pub const DEFAULT_ANCHOR_CONFIRMS_MIN: u32 = 3;

/// Maximum anchor depth a peer may require of us.
pub const DEFAULT_ANCHOR_CONFIRMS_MAX: u32 = 10;

/// Default commitment fee rate, in satoshis per 1000 bytes.
pub const DEFAULT_COMMITMENT_FEE_RATE: u64 = 50_000;

/// A peer's commitment fee rate must be at least this percentage of our
/// current fee-rate estimate.
pub const DEFAULT_COMMITMENT_FEE_MIN_PERCENT: u64 = 50;

/// And at most this percentage.
pub const DEFAULT_COMMITMENT_FEE_MAX_PERCENT: u64 = 200;

/// Default listening port for the peer transport.
pub const DEFAULT_LISTEN_PORT: u16 = 9735;

const DEFAULT_STORE_DIR_NAME: &str = "channel.db";

#[derive(ClapSerde, Debug, Clone)]
pub struct NodeConfig {
    /// base directory for the node state
    #[arg(
        name = "NODE_BASE_DIR",
        long = "node-base-dir",
        env,
        help = "base directory for node state [default: $BASE_DIR/node]"
    )]
    pub base_dir: Option<PathBuf>,

    /// address to listen on for peer connections [default: 0.0.0.0]
    #[arg(name = "NODE_LISTEN_ADDR", long = "node-listen-addr", env)]
    pub listen_addr: Option<String>,

    /// port to listen on for peer connections; 0 disables listening [default: 9735]
    #[arg(name = "NODE_LISTEN_PORT", long = "node-listen-port", env)]
    pub listen_port: Option<u16>,

    /// relative locktime (blocks) imposed on the peer's main output [default: 144]
    #[arg(name = "NODE_LOCKTIME_BLOCKS", long = "node-locktime-blocks", env)]
    pub locktime_blocks: Option<u32>,

    /// maximum relative locktime (blocks) accepted from a peer [default: 1008]
    #[arg(name = "NODE_LOCKTIME_MAX", long = "node-locktime-max", env)]
    pub locktime_max: Option<u32>,

    /// anchor confirmations we require [default: 3]
    #[arg(name = "NODE_ANCHOR_CONFIRMS_MIN", long = "node-anchor-confirms-min", env)]
    pub anchor_confirms_min: Option<u32>,

    /// maximum anchor confirmations a peer may require of us [default: 10]
    #[arg(name = "NODE_ANCHOR_CONFIRMS_MAX", long = "node-anchor-confirms-max", env)]
    pub anchor_confirms_max: Option<u32>,

    /// commitment fee rate in satoshis per 1000 bytes [default: 50000]
    #[arg(name = "NODE_COMMITMENT_FEE_RATE", long = "node-commitment-fee-rate", env)]
    pub commitment_fee_rate: Option<u64>,

    /// fee-rate estimate used to bound peers' commitment fee rates
    /// [default: 50000]
    #[arg(name = "NODE_FEE_RATE", long = "node-fee-rate", env)]
    pub fee_rate: Option<u64>,

    /// lower bound on a peer's commitment fee rate, percent of fee-rate [default: 50]
    #[arg(
        name = "NODE_COMMITMENT_FEE_MIN_PERCENT",
        long = "node-commitment-fee-min-percent",
        env
    )]
    pub commitment_fee_min_percent: Option<u64>,

    /// upper bound on a peer's commitment fee rate, percent of fee-rate [default: 200]
    #[arg(
        name = "NODE_COMMITMENT_FEE_MAX_PERCENT",
        long = "node-commitment-fee-max-percent",
        env
    )]
    pub commitment_fee_max_percent: Option<u64>,
}

impl NodeConfig {
    pub fn store_path(&self) -> PathBuf {
        let base_dir = self
            .base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        base_dir.join(DEFAULT_STORE_DIR_NAME)
    }

    pub fn listen_addr(&self) -> String {
        self.listen_addr
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn listen_port(&self) -> Option<u16> {
        match self.listen_port {
            Some(0) => None,
            Some(port) => Some(port),
            None => Some(DEFAULT_LISTEN_PORT),
        }
    }

    pub fn locktime_blocks(&self) -> u32 {
        self.locktime_blocks.unwrap_or(DEFAULT_LOCKTIME_BLOCKS)
    }

    pub fn locktime_max(&self) -> u32 {
        self.locktime_max.unwrap_or(DEFAULT_LOCKTIME_MAX)
    }

    pub fn anchor_confirms_min(&self) -> u32 {
        self.anchor_confirms_min
            .unwrap_or(DEFAULT_ANCHOR_CONFIRMS_MIN)
    }

    pub fn anchor_confirms_max(&self) -> u32 {
        self.anchor_confirms_max
            .unwrap_or(DEFAULT_ANCHOR_CONFIRMS_MAX)
    }

    pub fn commitment_fee_rate(&self) -> u64 {
        self.commitment_fee_rate
            .unwrap_or(DEFAULT_COMMITMENT_FEE_RATE)
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate.unwrap_or(DEFAULT_COMMITMENT_FEE_RATE)
    }

    pub fn commitment_fee_min_percent(&self) -> u64 {
        self.commitment_fee_min_percent
            .unwrap_or(DEFAULT_COMMITMENT_FEE_MIN_PERCENT)
    }

    pub fn commitment_fee_max_percent(&self) -> u64 {
        self.commitment_fee_max_percent
            .unwrap_or(DEFAULT_COMMITMENT_FEE_MAX_PERCENT)
    }
}
