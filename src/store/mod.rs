mod schema;
mod store_impl;

pub use store_impl::{DbTransaction, Store};

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ln::channel::ChannelState;
use crate::ln::htlc::{HtlcSide, HtlcState};
use crate::ln::shachain::{Shachain, SHACHAIN_BLOB_LEN};
use crate::ln::types::{EcdsaSignature, Hash256, Preimage, Privkey, Pubkey};
use schema::*;

pub(crate) fn serialize_to_vec<T: ?Sized + Serialize>(value: &T, field_name: &str) -> Vec<u8> {
    bincode::serialize(value)
        .unwrap_or_else(|e| panic!("serialization of {} failed: {}", field_name, e))
}

pub(crate) fn deserialize_from<'a, T>(slice: &'a [u8], field_name: &str) -> T
where
    T: serde::Deserialize<'a>,
{
    bincode::deserialize(slice)
        .unwrap_or_else(|e| panic!("deserialization of {} failed: {}", field_name, e))
}

// ============================================================
// Rows
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRow {
    pub state: ChannelState,
    pub offered_anchor: bool,
    pub our_feerate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretsRow {
    pub commitkey: Privkey,
    pub finalkey: Privkey,
    pub revocation_seed: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorRow {
    pub txid: Hash256,
    pub output_index: u32,
    pub amount: u64,
    pub ok_depth: u32,
    pub min_depth: u32,
    pub ours: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TheirVisibleRow {
    pub offered_anchor: bool,
    pub commitkey: Pubkey,
    pub finalkey: Pubkey,
    pub locktime_blocks: u32,
    pub mindepth: u32,
    pub commit_fee_rate: u64,
    pub next_revocation_hash: Hash256,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfoRow {
    pub commit_num: u64,
    pub revocation_hash: Hash256,
    pub xmit_order: i64,
    pub sig: Option<EcdsaSignature>,
    /// Only meaningful on the THEIRS side: the hash whose preimage the next
    /// UPDATE_REVOCATION must reveal.
    pub prev_revocation_hash: Option<Hash256>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HtlcRow {
    pub state: HtlcState,
    pub msat: u64,
    pub expiry_blocks: u32,
    pub rhash: Hash256,
    pub r: Option<Preimage>,
    pub routing: Vec<u8>,
    pub src: Option<(Pubkey, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClosingRow {
    pub our_fee: u64,
    pub their_fee: u64,
    pub their_sig: Option<EcdsaSignature>,
    pub our_script: Option<Vec<u8>>,
    pub their_script: Option<Vec<u8>>,
    pub shutdown_order: i64,
    pub closing_order: i64,
    pub sigs_in: u32,
}

impl Default for ClosingRow {
    fn default() -> Self {
        ClosingRow {
            our_fee: 0,
            their_fee: 0,
            their_sig: None,
            our_script: None,
            their_script: None,
            shutdown_order: -1,
            closing_order: -1,
            sigs_in: 0,
        }
    }
}

// ============================================================
// Keys
// ============================================================

fn peer_key(prefix: u8, peer: &Pubkey) -> Vec<u8> {
    [&[prefix], peer.serialize().as_slice()].concat()
}

fn commit_info_key(peer: &Pubkey, side: CommitSideTag) -> Vec<u8> {
    [&[COMMIT_INFO_PREFIX], peer.serialize().as_slice(), &[side as u8]].concat()
}

fn htlc_key(peer: &Pubkey, owner: HtlcSide, id: u64) -> Vec<u8> {
    [
        &[HTLC_PREFIX],
        peer.serialize().as_slice(),
        &[owner as u8],
        id.to_be_bytes().as_slice(),
    ]
    .concat()
}

/// Which commitment chain a commit_info row belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitSideTag {
    Ours = 0,
    Theirs = 1,
}

// ============================================================
// Committed reads (used at load time and by tests)
// ============================================================

impl Store {
    pub fn wallet_privkeys(&self) -> Vec<Privkey> {
        self.prefix_iterator(&[WALLET_PREFIX])
            .map(|(key, _)| {
                Privkey::from_slice(&key[1..]).expect("wallet key is a valid privkey")
            })
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<Pubkey> {
        self.prefix_iterator(&[PEER_PREFIX])
            .map(|(key, _)| Pubkey::from_slice(&key[1..]).expect("peer key is a valid pubkey"))
            .collect()
    }

    pub fn get_peer(&self, peer: &Pubkey) -> Option<PeerRow> {
        self.get(peer_key(PEER_PREFIX, peer))
            .map(|v| deserialize_from(&v, "PeerRow"))
    }

    pub fn get_secrets(&self, peer: &Pubkey) -> Option<SecretsRow> {
        self.get(peer_key(PEER_SECRETS_PREFIX, peer))
            .map(|v| deserialize_from(&v, "SecretsRow"))
    }

    pub fn get_address(&self, peer: &Pubkey) -> Option<SocketAddr> {
        self.get(peer_key(PEER_ADDRESS_PREFIX, peer))
            .map(|v| deserialize_from(&v, "SocketAddr"))
    }

    pub fn get_anchor(&self, peer: &Pubkey) -> Option<AnchorRow> {
        self.get(peer_key(ANCHOR_PREFIX, peer))
            .map(|v| deserialize_from(&v, "AnchorRow"))
    }

    pub fn get_their_visible_state(&self, peer: &Pubkey) -> Option<TheirVisibleRow> {
        self.get(peer_key(THEIR_VISIBLE_STATE_PREFIX, peer))
            .map(|v| deserialize_from(&v, "TheirVisibleRow"))
    }

    pub fn get_commit_info(&self, peer: &Pubkey, side: CommitSideTag) -> Option<CommitInfoRow> {
        self.get(commit_info_key(peer, side))
            .map(|v| deserialize_from(&v, "CommitInfoRow"))
    }

    pub fn get_shachain(&self, peer: &Pubkey) -> Option<Shachain> {
        self.get(peer_key(SHACHAIN_PREFIX, peer)).map(|v| {
            assert_eq!(v.len(), SHACHAIN_BLOB_LEN, "shachain blob length");
            Shachain::from_bytes(&v).expect("stored shachain is well-formed")
        })
    }

    pub fn get_closing(&self, peer: &Pubkey) -> Option<ClosingRow> {
        self.get(peer_key(CLOSING_PREFIX, peer))
            .map(|v| deserialize_from(&v, "ClosingRow"))
    }

    pub fn get_htlc(&self, peer: &Pubkey, owner: HtlcSide, id: u64) -> Option<HtlcRow> {
        self.get(htlc_key(peer, owner, id))
            .map(|v| deserialize_from(&v, "HtlcRow"))
    }

    /// Every HTLC row of the peer in ascending id order (the replay order).
    pub fn get_htlcs(&self, peer: &Pubkey) -> Vec<(HtlcSide, u64, HtlcRow)> {
        let prefix = peer_key(HTLC_PREFIX, peer);
        let mut rows: Vec<(HtlcSide, u64, HtlcRow)> = self
            .prefix_iterator(&prefix)
            .map(|(key, value)| {
                let owner = match key[prefix.len()] {
                    0 => HtlcSide::Local,
                    1 => HtlcSide::Remote,
                    other => panic!("bad htlc owner tag {}", other),
                };
                let id = u64::from_be_bytes(
                    key[prefix.len() + 1..]
                        .try_into()
                        .expect("htlc id is 8 bytes"),
                );
                (owner, id, deserialize_from(&value, "HtlcRow"))
            })
            .collect();
        rows.sort_by_key(|(_, id, _)| *id);
        rows
    }

    /// A canonical dump of every row, for idempotence comparisons.
    pub fn dump_all(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows: Vec<_> = self
            .prefix_iterator(&[])
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        rows.sort();
        rows
    }
}

// ============================================================
// Transactional writes: the db twins of every protocol mutation
// ============================================================

impl DbTransaction<'_> {
    pub fn add_wallet_privkey(&mut self, privkey: &Privkey) {
        self.put(
            [&[WALLET_PREFIX], privkey.serialize().as_slice()].concat(),
            Vec::new(),
        );
    }

    /// Create the peer: peers + peer_secrets + peer_address rows.
    pub fn create_peer(
        &mut self,
        peer: &Pubkey,
        row: &PeerRow,
        secrets: &SecretsRow,
        addr: &SocketAddr,
    ) {
        debug!("db: create_peer({})", peer);
        self.put(peer_key(PEER_PREFIX, peer), serialize_to_vec(row, "PeerRow"));
        self.put(
            peer_key(PEER_SECRETS_PREFIX, peer),
            serialize_to_vec(secrets, "SecretsRow"),
        );
        self.put(
            peer_key(PEER_ADDRESS_PREFIX, peer),
            serialize_to_vec(addr, "SocketAddr"),
        );
    }

    pub fn peer_exists(&self, peer: &Pubkey) -> bool {
        self.get(&peer_key(PEER_PREFIX, peer)).is_some()
    }

    pub fn update_peer_state(&mut self, peer: &Pubkey, state: &ChannelState) {
        debug!("db: update_peer_state({}) -> {:?}", peer, state);
        let key = peer_key(PEER_PREFIX, peer);
        let mut row: PeerRow = self
            .get(&key)
            .map(|v| deserialize_from(&v, "PeerRow"))
            .expect("peer row exists");
        row.state = *state;
        self.put(key, serialize_to_vec(&row, "PeerRow"));
    }

    pub fn update_our_feerate(&mut self, peer: &Pubkey, fee_rate: u64) {
        debug!("db: update_our_feerate({}) -> {}", peer, fee_rate);
        let key = peer_key(PEER_PREFIX, peer);
        let mut row: PeerRow = self
            .get(&key)
            .map(|v| deserialize_from(&v, "PeerRow"))
            .expect("peer row exists");
        row.our_feerate = fee_rate;
        self.put(key, serialize_to_vec(&row, "PeerRow"));
    }

    pub fn set_visible_state(&mut self, peer: &Pubkey, row: &TheirVisibleRow) {
        debug!("db: set_visible_state({})", peer);
        self.put(
            peer_key(THEIR_VISIBLE_STATE_PREFIX, peer),
            serialize_to_vec(row, "TheirVisibleRow"),
        );
    }

    pub fn update_next_revocation_hash(&mut self, peer: &Pubkey, hash: &Hash256) {
        debug!("db: update_next_revocation_hash({}):{:x}", peer, hash);
        let key = peer_key(THEIR_VISIBLE_STATE_PREFIX, peer);
        let mut row: TheirVisibleRow = self
            .get(&key)
            .map(|v| deserialize_from(&v, "TheirVisibleRow"))
            .expect("their_visible_state row exists");
        row.next_revocation_hash = *hash;
        self.put(key, serialize_to_vec(&row, "TheirVisibleRow"));
    }

    pub fn update_their_commit_fee_rate(&mut self, peer: &Pubkey, fee_rate: u64) {
        let key = peer_key(THEIR_VISIBLE_STATE_PREFIX, peer);
        let mut row: TheirVisibleRow = self
            .get(&key)
            .map(|v| deserialize_from(&v, "TheirVisibleRow"))
            .expect("their_visible_state row exists");
        row.commit_fee_rate = fee_rate;
        self.put(key, serialize_to_vec(&row, "TheirVisibleRow"));
    }

    pub fn set_anchor(&mut self, peer: &Pubkey, row: &AnchorRow) {
        debug!("db: set_anchor({})", peer);
        self.put(
            peer_key(ANCHOR_PREFIX, peer),
            serialize_to_vec(row, "AnchorRow"),
        );
    }

    pub fn new_commit_info(&mut self, peer: &Pubkey, side: CommitSideTag, row: &CommitInfoRow) {
        debug!(
            "db: new_commit_info({}, {:?}) commit_num={}",
            peer, side, row.commit_num
        );
        self.put(
            commit_info_key(peer, side),
            serialize_to_vec(row, "CommitInfoRow"),
        );
    }

    /// Clear the witness for their last revocation, once consumed.
    pub fn remove_their_prev_revocation_hash(&mut self, peer: &Pubkey) {
        debug!("db: remove_their_prev_revocation_hash({})", peer);
        let key = commit_info_key(peer, CommitSideTag::Theirs);
        let mut row: CommitInfoRow = self
            .get(&key)
            .map(|v| deserialize_from(&v, "CommitInfoRow"))
            .expect("their commit_info row exists");
        row.prev_revocation_hash = None;
        self.put(key, serialize_to_vec(&row, "CommitInfoRow"));
    }

    pub fn save_shachain(&mut self, peer: &Pubkey, chain: &Shachain) {
        debug!("db: save_shachain({})", peer);
        self.put(peer_key(SHACHAIN_PREFIX, peer), chain.to_bytes());
    }

    pub fn new_htlc(&mut self, peer: &Pubkey, owner: HtlcSide, id: u64, row: &HtlcRow) {
        debug!("db: new_htlc({}) {:?} {}", peer, owner, id);
        self.put(htlc_key(peer, owner, id), serialize_to_vec(row, "HtlcRow"));
    }

    /// The guarded state-transition twin: refuses to write when the stored
    /// state is not `old`. A zero-row effect is a protocol bug and must
    /// fail loudly.
    pub fn update_htlc_state(
        &mut self,
        peer: &Pubkey,
        owner: HtlcSide,
        id: u64,
        old: HtlcState,
        new: HtlcState,
    ) -> Result<(), String> {
        debug!(
            "db: update_htlc_state({}) {:?} {}: {:?}->{:?}",
            peer, owner, id, old, new
        );
        let key = htlc_key(peer, owner, id);
        let mut row: HtlcRow = match self.get(&key) {
            Some(v) => deserialize_from(&v, "HtlcRow"),
            None => return Err(format!("update_htlc_state: no HTLC {:?}/{}", owner, id)),
        };
        if row.state != old {
            return Err(format!(
                "update_htlc_state: HTLC {:?}/{} is {:?}, not {:?}",
                owner, id, row.state, old
            ));
        }
        row.state = new;
        self.put(key, serialize_to_vec(&row, "HtlcRow"));
        Ok(())
    }

    /// Record the preimage; guarded on the current state.
    pub fn htlc_fulfilled(
        &mut self,
        peer: &Pubkey,
        owner: HtlcSide,
        id: u64,
        r: &Preimage,
        state: HtlcState,
    ) -> Result<(), String> {
        debug!("db: htlc_fulfilled({}) {:?} {}", peer, owner, id);
        let key = htlc_key(peer, owner, id);
        let mut row: HtlcRow = match self.get(&key) {
            Some(v) => deserialize_from(&v, "HtlcRow"),
            None => return Err(format!("htlc_fulfilled: no HTLC {:?}/{}", owner, id)),
        };
        if row.state != state {
            return Err(format!(
                "htlc_fulfilled: HTLC {:?}/{} is {:?}, not {:?}",
                owner, id, row.state, state
            ));
        }
        row.r = Some(*r);
        self.put(key, serialize_to_vec(&row, "HtlcRow"));
        Ok(())
    }

    /// Record a counterparty commitment txid for the on-chain watcher.
    pub fn add_commit_map(&mut self, peer: &Pubkey, txid: &Hash256, commit_num: u64) {
        debug!("db: add_commit_map({}), commit_num={}", peer, commit_num);
        self.put(
            [
                &[THEIR_COMMITMENTS_PREFIX],
                peer.serialize().as_slice(),
                txid.as_ref(),
            ]
            .concat(),
            serialize_to_vec(&commit_num, "commit_num"),
        );
    }

    pub fn save_closing(&mut self, peer: &Pubkey, row: &ClosingRow) {
        debug!("db: save_closing({})", peer);
        self.put(
            peer_key(CLOSING_PREFIX, peer),
            serialize_to_vec(row, "ClosingRow"),
        );
    }

    /// Delete every row of a peer, in one transaction. Only valid once the
    /// CLOSED state has been reached.
    pub fn forget_peer(&mut self, peer: &Pubkey) {
        debug!("db: forget_peer({})", peer);
        for prefix in PEER_TABLE_PREFIXES {
            let full = peer_key(prefix, peer);
            let keys: Vec<Vec<u8>> = self
                .store()
                .prefix_iterator(&full)
                .map(|(k, _)| k.to_vec())
                .collect();
            for key in keys {
                self.delete(key);
            }
        }
    }
}
