//!
//! +--------------+------------------------------+---------------------+
//! | KeyPrefix::  | Key::                        | Value::             |
//! +--------------+------------------------------+---------------------+
//! | 0            | privkey[32]                  | (empty)             |
//! | 16           | peer_pubkey[33]              | PeerRow             |
//! | 17           | peer_pubkey[33]              | SecretsRow          |
//! | 18           | peer_pubkey[33]              | SocketAddr          |
//! | 32           | peer_pubkey[33]              | AnchorRow           |
//! | 33           | peer_pubkey[33]              | TheirVisibleRow     |
//! | 34           | peer_pubkey[33] | side       | CommitInfoRow       |
//! | 48           | peer_pubkey[33] | owner | id | HtlcRow             |
//! | 49           | peer_pubkey[33]              | shachain[2612]      |
//! | 50           | peer_pubkey[33] | txid[32]   | commit_num u64      |
//! | 64           | peer_pubkey[33]              | ClosingRow          |
//! +--------------+------------------------------+---------------------+

pub(crate) const WALLET_PREFIX: u8 = 0;
pub(crate) const PEER_PREFIX: u8 = 16;
pub(crate) const PEER_SECRETS_PREFIX: u8 = 17;
pub(crate) const PEER_ADDRESS_PREFIX: u8 = 18;
pub(crate) const ANCHOR_PREFIX: u8 = 32;
pub(crate) const THEIR_VISIBLE_STATE_PREFIX: u8 = 33;
pub(crate) const COMMIT_INFO_PREFIX: u8 = 34;
pub(crate) const HTLC_PREFIX: u8 = 48;
pub(crate) const SHACHAIN_PREFIX: u8 = 49;
pub(crate) const THEIR_COMMITMENTS_PREFIX: u8 = 50;
pub(crate) const CLOSING_PREFIX: u8 = 64;

/// Every per-peer table, in deletion order for forget_peer.
pub(crate) const PEER_TABLE_PREFIXES: [u8; 10] = [
    ANCHOR_PREFIX,
    HTLC_PREFIX,
    COMMIT_INFO_PREFIX,
    SHACHAIN_PREFIX,
    THEIR_VISIBLE_STATE_PREFIX,
    THEIR_COMMITMENTS_PREFIX,
    PEER_SECRETS_PREFIX,
    CLOSING_PREFIX,
    PEER_ADDRESS_PREFIX,
    PEER_PREFIX,
];
