#![allow(dead_code)]

use std::net::SocketAddr;

use tempfile::TempDir;

use crate::ln::channel::{
    AddHtlcCommand, AnchorFunding, ChannelActorState, ChannelEvent, OpenChannelParams,
    ProcessingChannelError,
};
use crate::ln::config::NodeConfig;
use crate::ln::types::{sha256, Hash256, PeerMessage, Preimage, Privkey, Pubkey};
use crate::store::{SecretsRow, Store};

pub const ANCHOR_SATOSHIS: u64 = 1_000_000;
pub const FEE_RATE: u64 = 50_000;

pub fn privkey(fill: u8) -> Privkey {
    Privkey::from_slice(&[fill; 32]).expect("valid test privkey")
}

pub fn secrets(fill: u8) -> SecretsRow {
    SecretsRow {
        commitkey: privkey(fill),
        finalkey: privkey(fill.wrapping_add(1)),
        revocation_seed: [fill.wrapping_add(2); 32],
    }
}

pub fn test_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().expect("valid addr")
}

pub fn preimage(fill: u8) -> Preimage {
    Preimage::from([fill; 32])
}

pub fn anchor_funding() -> AnchorFunding {
    AnchorFunding {
        txid: sha256(b"test anchor tx"),
        output_index: 0,
        amount: ANCHOR_SATOSHIS,
    }
}

pub fn add_htlc_command(msat: u64, rhash: Hash256) -> AddHtlcCommand {
    AddHtlcCommand {
        msat,
        rhash,
        expiry_blocks: 500,
        routing: b"route".to_vec(),
        src: None,
    }
}

/// Two channel endpoints joined back to back, each with its own store,
/// driven by handing packets across directly.
pub struct ChannelPair {
    pub a: ChannelActorState,
    pub b: ChannelActorState,
    pub store_a: Store,
    pub store_b: Store,
    pub config: NodeConfig,
    _dir_a: TempDir,
    _dir_b: TempDir,
}

impl ChannelPair {
    pub fn new() -> Self {
        Self::with_anchor(ANCHOR_SATOSHIS)
    }

    pub fn with_anchor(anchor_sat: u64) -> Self {
        let dir_a = TempDir::new().expect("tempdir");
        let dir_b = TempDir::new().expect("tempdir");
        let store_a = Store::new(dir_a.path().join("db")).expect("open store");
        let store_b = Store::new(dir_b.path().join("db")).expect("open store");
        let config = NodeConfig::default();

        let node_a = privkey(0xa0).pubkey();
        let node_b = privkey(0xb0).pubkey();

        let mut funding = anchor_funding();
        funding.amount = anchor_sat;

        let mut a = ChannelActorState::new(
            node_b,
            node_a,
            test_addr(9001),
            OpenChannelParams {
                commit_fee_rate: FEE_RATE,
                locktime_blocks: config.locktime_blocks(),
                min_depth: config.anchor_confirms_min(),
                secrets: secrets(0x11),
                funding: Some(funding),
            },
        );
        let b = ChannelActorState::new(
            node_a,
            node_b,
            test_addr(9002),
            OpenChannelParams {
                commit_fee_rate: FEE_RATE,
                locktime_blocks: config.locktime_blocks(),
                min_depth: config.anchor_confirms_min(),
                secrets: secrets(0x21),
                funding: None,
            },
        );
        a.initiate_open();

        ChannelPair {
            a,
            b,
            store_a,
            store_b,
            config,
            _dir_a: dir_a,
            _dir_b: dir_b,
        }
    }

    pub fn deliver(
        config: &NodeConfig,
        store: &Store,
        to: &mut ChannelActorState,
        message: PeerMessage,
    ) -> Result<(), ProcessingChannelError> {
        let mut txn = store.begin_transaction();
        match to.handle_peer_message(&mut txn, config, message) {
            Ok(()) => {
                txn.commit().expect("commit");
                Ok(())
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Ferry queued packets both ways until the channel goes quiet.
    pub fn settle(&mut self) {
        loop {
            let a_out = self.a.take_outpkt();
            let b_out = self.b.take_outpkt();
            if a_out.is_empty() && b_out.is_empty() {
                break;
            }
            for message in a_out {
                Self::deliver(&self.config, &self.store_b, &mut self.b, message)
                    .expect("b accepts packet");
            }
            for message in b_out {
                Self::deliver(&self.config, &self.store_a, &mut self.a, message)
                    .expect("a accepts packet");
            }
        }
        self.a.take_relay();
        self.b.take_relay();
    }

    pub fn confirm_anchor(&mut self, depth: u32) {
        let mut txn = self.store_a.begin_transaction();
        self.a
            .handle_event(&mut txn, &ChannelEvent::AnchorConfirmed(depth))
            .expect("a anchor event");
        txn.commit().expect("commit");
        let mut txn = self.store_b.begin_transaction();
        self.b
            .handle_event(&mut txn, &ChannelEvent::AnchorConfirmed(depth))
            .expect("b anchor event");
        txn.commit().expect("commit");
    }

    /// Drive the whole open handshake through to NORMAL operation.
    pub fn open_to_normal(&mut self) {
        self.settle();
        self.confirm_anchor(6);
        self.settle();
    }

    pub fn node_a_id(&self) -> Pubkey {
        self.a.local_node_id
    }
}

/// Run a closure inside a transaction on the store, committing on Ok.
pub fn with_txn<T>(
    store: &Store,
    f: impl FnOnce(&mut crate::store::DbTransaction) -> Result<T, ProcessingChannelError>,
) -> Result<T, ProcessingChannelError> {
    let mut txn = store.begin_transaction();
    match f(&mut txn) {
        Ok(value) => {
            txn.commit().expect("commit");
            Ok(value)
        }
        Err(err) => {
            txn.abort();
            Err(err)
        }
    }
}
