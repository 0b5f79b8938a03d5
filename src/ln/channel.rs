use std::net::SocketAddr;

use bitflags::bitflags;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::store::{
    AnchorRow, ClosingRow, CommitInfoRow, CommitSideTag, DbTransaction, HtlcRow, PeerRow,
    SecretsRow, Store, TheirVisibleRow,
};

use super::config::NodeConfig;
use super::cstate::{ChannelBalance, Side};
use super::fee::{fee_by_rate, is_dust, COMMITMENT_TX_BASE_BYTES};
use super::htlc::{Htlc, HtlcRegistry, HtlcSide, HtlcState, Step};
use super::network::{NetworkActorCommand, NetworkActorMessage, PeerMessageWithId};
use super::shachain::{shachain_from_seed, Shachain};
use super::types::{
    sha256, AnchorOffer, CloseShutdown, CloseSignature, EcdsaSignature, ErrorPacket, Hash256,
    Locktime, Open, OpenAnchor, OpenCommitSig, OpenComplete, PeerMessage, Preimage, Pubkey,
    Reconnect, UpdateAddHtlc, UpdateCommit, UpdateFailHtlc, UpdateFee, UpdateFulfillHtlc,
    UpdateRevocation,
};

pub const ASSUME_NETWORK_ACTOR_ALIVE: &str = "network actor must be alive";

/// A node must not offer more than this many HTLCs in the counterparty's
/// commitment transaction.
pub const MAX_HTLCS_IN_FLIGHT: u32 = 300;

// ============================================================
// Actor surface
// ============================================================

#[derive(Debug)]
pub enum ChannelActorMessage {
    /// A packet from the remote peer, in arrival order.
    PeerMessage(PeerMessage),
    /// A local intent.
    Command(ChannelCommand),
    /// Something the outside world tells us about.
    Event(ChannelEvent),
}

#[derive(Debug, Clone)]
pub struct AddHtlcCommand {
    pub msat: u64,
    pub rhash: Hash256,
    pub expiry_blocks: u32,
    pub routing: Vec<u8>,
    /// Upstream HTLC this add forwards, if any.
    pub src: Option<(Pubkey, u64)>,
}

#[derive(Debug, Clone)]
pub enum ChannelCommand {
    AddHtlc(AddHtlcCommand),
    FulfillHtlc { id: u64, r: Preimage },
    FailHtlc { id: u64, reason: Vec<u8> },
    AdjustFee { fee_rate: u64 },
    Shutdown,
}

#[derive(Debug)]
pub enum ChannelEvent {
    /// The anchor reached the given confirmation depth.
    AnchorConfirmed(u32),
    /// The transport to the peer came (back) up.
    PeerConnected,
    PeerDisconnected,
    Stop(StopReason),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StopReason {
    Abandon,
    Closed,
    PeerDisconnected,
}

pub type ProcessingChannelResult = Result<(), ProcessingChannelError>;

#[derive(Error, Debug, Clone)]
pub enum ProcessingChannelError {
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Capacity rejection: {0}")]
    CapacityRejection(String),
    #[error("Repeated processing message: {0}")]
    RepeatedProcessing(String),
    #[error("Storage failure: {0}")]
    StorageFailure(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ProcessingChannelError {
    /// The human string carried in an ERROR packet. Validation errors go
    /// out verbatim; everything else keeps its category prefix.
    pub fn wire_problem(&self) -> String {
        match self {
            ProcessingChannelError::ProtocolViolation(s)
            | ProcessingChannelError::InvalidParameter(s)
            | ProcessingChannelError::CapacityRejection(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Fatal errors tear the channel down without an ERROR packet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProcessingChannelError::StorageFailure(_) | ProcessingChannelError::InternalError(_)
        )
    }
}

impl From<String> for ProcessingChannelError {
    fn from(s: String) -> Self {
        // Guarded store updates that hit zero rows are protocol bugs.
        ProcessingChannelError::StorageFailure(s)
    }
}

// ============================================================
// Channel lifecycle
// ============================================================

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NegotiatingOpenFlags: u32 {
        const OUR_OPEN_SENT = 1;
        const THEIR_OPEN_RECEIVED = 1 << 1;
        const OPEN_EXCHANGED = NegotiatingOpenFlags::OUR_OPEN_SENT.bits()
            | NegotiatingOpenFlags::THEIR_OPEN_RECEIVED.bits();
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AwaitingAnchorFlags: u32 {
        /// The anchor outpoint is known (we broadcast it or they told us).
        const ANCHOR_SET = 1;
        /// The first-commitment signature has been exchanged.
        const SIG_EXCHANGED = 1 << 1;
        const OUR_COMPLETE_SENT = 1 << 2;
        const THEIR_COMPLETE_RECEIVED = 1 << 3;
        const COMPLETE_EXCHANGED = AwaitingAnchorFlags::OUR_COMPLETE_SENT.bits()
            | AwaitingAnchorFlags::THEIR_COMPLETE_RECEIVED.bits();
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ShuttingDownFlags: u32 {
        const OUR_SHUTDOWN_SENT = 1;
        const THEIR_SHUTDOWN_SENT = 1 << 1;
        const SHUTDOWN_EXCHANGED = ShuttingDownFlags::OUR_SHUTDOWN_SENT.bits()
            | ShuttingDownFlags::THEIR_SHUTDOWN_SENT.bits();
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CloseFlags: u32 {
        /// Closed by a completed signature exchange.
        const COOPERATIVE = 1;
        /// Closed after a protocol error; on-chain resolution takes over.
        const UNCOOPERATIVE = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Exchanging OPEN packets and negotiating parameters.
    NegotiatingOpen(NegotiatingOpenFlags),
    /// The anchor is being created/confirmed; OPEN_COMPLETE not yet
    /// exchanged both ways.
    AwaitingAnchor(AwaitingAnchorFlags),
    /// Normal operation.
    ChannelReady,
    /// Shutdown scripts exchanged, draining HTLCs and negotiating the
    /// close fee.
    ShuttingDown(ShuttingDownFlags),
    /// No further protocol activity.
    Closed(CloseFlags),
}

impl ChannelState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed(_))
    }

    /// Whether the anchor-dependent state (cstates, commit chains,
    /// shachain) exists and must be reloaded on restart.
    pub fn is_anchor_ready(&self) -> bool {
        match self {
            ChannelState::NegotiatingOpen(_) => false,
            ChannelState::AwaitingAnchor(flags) => flags.contains(AwaitingAnchorFlags::ANCHOR_SET),
            ChannelState::ChannelReady | ChannelState::ShuttingDown(_) => true,
            ChannelState::Closed(_) => false,
        }
    }
}

// ============================================================
// Commitment transactions
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOut {
    pub sat: u64,
    pub script: Vec<u8>,
}

/// The channel's off-chain view as a spendable transaction: one input (the
/// anchor outpoint) and outputs for both balances plus every non-dust HTLC.
/// Script construction and witness data belong to the on-chain collaborator;
/// here scripts are the deterministic byte encodings both sides agree on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitmentTx {
    pub anchor_txid: Hash256,
    pub anchor_index: u32,
    pub outputs: Vec<TxOut>,
}

impl CommitmentTx {
    pub fn txid(&self) -> Hash256 {
        let encoded = bincode::serialize(self).expect("serialize commitment tx");
        sha256(sha256(encoded))
    }
}

fn redeem_delayed(key: &Pubkey, revocation_hash: &Hash256, delay_blocks: u32) -> Vec<u8> {
    let mut script = vec![0x01];
    script.extend_from_slice(&key.serialize());
    script.extend_from_slice(revocation_hash.as_ref());
    script.extend_from_slice(&delay_blocks.to_le_bytes());
    script
}

fn redeem_simple(key: &Pubkey) -> Vec<u8> {
    let mut script = vec![0x02];
    script.extend_from_slice(&key.serialize());
    script
}

fn redeem_htlc(
    offerer_key: &Pubkey,
    recipient_key: &Pubkey,
    rhash: &Hash256,
    expiry_blocks: u32,
) -> Vec<u8> {
    let mut script = vec![0x03];
    script.extend_from_slice(&offerer_key.serialize());
    script.extend_from_slice(&recipient_key.serialize());
    script.extend_from_slice(rhash.as_ref());
    script.extend_from_slice(&expiry_blocks.to_le_bytes());
    script
}

/// A single-key shutdown script.
pub fn shutdown_script(key: &Pubkey) -> Vec<u8> {
    let mut script = vec![0x00, 0x14];
    script.extend_from_slice(&sha256(key.serialize()).as_ref()[..20]);
    script
}

/// Outputs are permuted into the canonical (value, script) order so both
/// sides serialize the identical transaction.
fn permute_outputs(outputs: &mut [TxOut]) {
    outputs.sort_by(|a, b| a.sat.cmp(&b.sat).then_with(|| a.script.cmp(&b.script)));
}

// ============================================================
// Per-side and per-channel state
// ============================================================

#[derive(Debug, Clone)]
pub struct AnchorInfo {
    pub txid: Hash256,
    pub output_index: u32,
    pub satoshis: u64,
    /// Did we fund it?
    pub ours: bool,
    /// Depth we require before OPEN_COMPLETE.
    pub min_depth: u32,
    /// Deepest confirmation observed so far.
    pub ok_depth: u32,
}

/// One commitment in a side's chain.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    /// Monotone, starting at 0.
    pub commit_num: u64,
    /// SHA-256 of the preimage that will revoke this commitment.
    pub revocation_hash: Hash256,
    /// Transmit-order stamp of the packet that produced this commitment
    /// (-1 until one was sent).
    pub order: i64,
    /// The counterparty's signature, when we hold one.
    pub sig: Option<EcdsaSignature>,
    pub cstate: Option<ChannelBalance>,
    pub tx: Option<CommitmentTx>,
}

impl CommitInfo {
    fn new(commit_num: u64, revocation_hash: Hash256) -> Self {
        CommitInfo {
            commit_num,
            revocation_hash,
            order: -1,
            sig: None,
            cstate: None,
            tx: None,
        }
    }

    pub fn txid(&self) -> Option<Hash256> {
        self.tx.as_ref().map(|tx| tx.txid())
    }
}

/// Everything we track per party: long-term keys, negotiated parameters,
/// the current commitment and the staging cstate its successor will capture.
#[derive(Debug, Clone)]
pub struct SideState {
    pub commitkey: Pubkey,
    pub finalkey: Pubkey,
    /// Relative locktime this party imposes on the other's main output.
    pub locktime_blocks: u32,
    /// Depth this party requires of the anchor.
    pub mindepth: u32,
    pub commit_fee_rate: u64,
    /// The revocation hash for this party's *next* commitment.
    pub next_revocation_hash: Hash256,
    pub offered_anchor: bool,
    pub commit: CommitInfo,
    pub staging: Option<ChannelBalance>,
}

/// Parameters for creating a fresh channel to a peer.
#[derive(Debug, Clone)]
pub struct OpenChannelParams {
    pub commit_fee_rate: u64,
    pub locktime_blocks: u32,
    pub min_depth: u32,
    pub secrets: SecretsRow,
    /// Set when we will create the anchor: the funding outpoint supplied by
    /// the wallet collaborator.
    pub funding: Option<AnchorFunding>,
}

#[derive(Debug, Clone)]
pub struct AnchorFunding {
    pub txid: Hash256,
    pub output_index: u32,
    pub amount: u64,
}

/// Actions the channel asks the node to relay to another channel.
#[derive(Debug, Clone)]
pub enum RelayAction {
    FulfillUpstream { peer: Pubkey, id: u64, r: Preimage },
    FailUpstream { peer: Pubkey, id: u64, reason: Vec<u8> },
}

/// The full in-memory state of one channel (one peer).
#[derive(Debug)]
pub struct ChannelActorState {
    pub state: ChannelState,
    pub peer_id: Pubkey,
    pub local_node_id: Pubkey,
    pub addr: SocketAddr,
    pub secrets: SecretsRow,
    pub anchor: Option<AnchorInfo>,
    pub local: SideState,
    pub remote: Option<SideState>,
    pub htlcs: HtlcRegistry,
    /// Next id for an HTLC we offer.
    pub htlc_id_counter: u64,
    /// Their revocation preimages, compressed.
    pub their_preimages: Shachain,
    /// The hash whose preimage their next UPDATE_REVOCATION must reveal.
    /// Set when we sign their new commitment, cleared when the revocation
    /// for the previous one arrives.
    pub their_prev_revocation_hash: Option<Hash256>,
    pub closing: ClosingRow,
    /// Stamps outgoing commit/revocation/shutdown/closing packets to define
    /// retransmit ordering after reconnect.
    pub order_counter: i64,
    /// Count of order-stamped packets received from the peer; sent as the
    /// RECONNECT ack.
    pub their_order_count: u64,
    pub reestablishing: bool,
    funding: Option<AnchorFunding>,
    outpkt: Vec<PeerMessage>,
    relay: Vec<RelayAction>,
}

impl ChannelActorState {
    pub fn new(
        peer_id: Pubkey,
        local_node_id: Pubkey,
        addr: SocketAddr,
        params: OpenChannelParams,
    ) -> Self {
        let revocation_seed = params.secrets.revocation_seed;
        let local = SideState {
            commitkey: params.secrets.commitkey.pubkey(),
            finalkey: params.secrets.finalkey.pubkey(),
            locktime_blocks: params.locktime_blocks,
            mindepth: params.min_depth,
            commit_fee_rate: params.commit_fee_rate,
            next_revocation_hash: revocation_hash_from_seed(&revocation_seed, 1),
            offered_anchor: params.funding.is_some(),
            commit: CommitInfo::new(0, revocation_hash_from_seed(&revocation_seed, 0)),
            staging: None,
        };
        ChannelActorState {
            state: ChannelState::NegotiatingOpen(NegotiatingOpenFlags::empty()),
            peer_id,
            local_node_id,
            addr,
            secrets: params.secrets,
            anchor: None,
            local,
            remote: None,
            htlcs: HtlcRegistry::default(),
            htlc_id_counter: 0,
            their_preimages: Shachain::new(),
            their_prev_revocation_hash: None,
            closing: ClosingRow::default(),
            order_counter: 0,
            their_order_count: 0,
            reestablishing: false,
            funding: params.funding,
            outpkt: Vec::new(),
            relay: Vec::new(),
        }
    }

    pub fn take_outpkt(&mut self) -> Vec<PeerMessage> {
        std::mem::take(&mut self.outpkt)
    }

    pub fn take_relay(&mut self) -> Vec<RelayAction> {
        std::mem::take(&mut self.relay)
    }

    fn remote(&self) -> &SideState {
        self.remote.as_ref().expect("remote side negotiated")
    }

    fn remote_mut(&mut self) -> &mut SideState {
        self.remote.as_mut().expect("remote side negotiated")
    }

    fn anchor_info(&self) -> &AnchorInfo {
        self.anchor.as_ref().expect("anchor known")
    }

    fn next_order(&mut self) -> i64 {
        let order = self.order_counter;
        self.order_counter += 1;
        order
    }

    /// Our revocation preimage for commitment `commit_num`.
    fn revocation_preimage(&self, commit_num: u64) -> Preimage {
        Preimage::from(shachain_from_seed(
            &self.secrets.revocation_seed,
            u64::MAX - commit_num,
        ))
    }

    pub fn local_balance_msat(&self) -> u64 {
        self.local
            .staging
            .as_ref()
            .map(|c| c.side(Side::Ours).pay_msat)
            .unwrap_or_default()
    }

    // ============================================================
    // Packet producers
    // ============================================================

    fn queue_pkt(&mut self, pkt: PeerMessage) {
        debug!("Queued pkt {} (order counter {})", pkt, self.order_counter);
        self.outpkt.push(pkt);
    }

    fn queue_pkt_open(&mut self) {
        let anchor_offer = if self.local.offered_anchor {
            AnchorOffer::WillCreateAnchor
        } else {
            AnchorOffer::WontCreateAnchor
        };
        let open = Open {
            revocation_hash: self.local.commit.revocation_hash,
            next_revocation_hash: self.local.next_revocation_hash,
            commit_key: self.local.commitkey,
            final_key: self.local.finalkey,
            delay: Locktime::Blocks(self.local.locktime_blocks),
            initial_fee_rate: self.local.commit_fee_rate,
            anchor_offer,
            min_depth: self.local.mindepth,
        };
        self.queue_pkt(PeerMessage::Open(open));
    }

    fn queue_pkt_anchor(&mut self) {
        let anchor = self.anchor_info();
        let pkt = OpenAnchor {
            txid: anchor.txid,
            output_index: anchor.output_index,
            amount: anchor.satoshis,
        };
        self.queue_pkt(PeerMessage::OpenAnchor(pkt));
    }

    fn queue_pkt_open_commit_sig(&mut self) {
        let sig = self
            .remote()
            .commit
            .sig
            .expect("first commitment signed before OPEN_COMMIT_SIG");
        self.queue_pkt(PeerMessage::OpenCommitSig(OpenCommitSig { sig }));
    }

    fn queue_pkt_open_complete(&mut self) {
        self.queue_pkt(PeerMessage::OpenComplete(OpenComplete {}));
    }

    fn queue_pkt_htlc_add(&mut self, owner: HtlcSide, id: u64) {
        let htlc = self.htlcs.get(owner, id).expect("queued HTLC exists");
        let pkt = UpdateAddHtlc {
            id: htlc.id,
            amount_msat: htlc.msat,
            rhash: htlc.rhash,
            expiry: Locktime::Blocks(htlc.expiry_blocks),
            route: htlc.routing.clone(),
        };
        self.queue_pkt(PeerMessage::UpdateAddHtlc(pkt));
    }

    fn queue_pkt_htlc_fulfill(&mut self, id: u64, r: Preimage) {
        self.queue_pkt(PeerMessage::UpdateFulfillHtlc(UpdateFulfillHtlc { id, r }));
    }

    fn queue_pkt_htlc_fail(&mut self, id: u64, reason: Vec<u8>) {
        self.queue_pkt(PeerMessage::UpdateFailHtlc(UpdateFailHtlc { id, reason }));
    }

    fn queue_pkt_commit(&mut self, sig: Option<EcdsaSignature>) {
        self.queue_pkt(PeerMessage::UpdateCommit(UpdateCommit { sig }));
    }

    /// Send the preimage for the old commitment; the one we have just
    /// committed to is in `local.commit`.
    fn queue_pkt_revocation(&mut self) {
        let revoked = self.local.commit.commit_num - 1;
        let pkt = UpdateRevocation {
            revocation_preimage: self.revocation_preimage(revoked),
            next_revocation_hash: self.local.next_revocation_hash,
        };
        self.queue_pkt(PeerMessage::UpdateRevocation(pkt));
    }

    fn queue_pkt_close_shutdown(&mut self) {
        let script = self
            .closing
            .our_script
            .clone()
            .expect("our shutdown script set");
        self.queue_pkt(PeerMessage::CloseShutdown(CloseShutdown {
            script_pubkey: script,
        }));
    }

    fn queue_pkt_close_signature(&mut self) {
        let close_tx = self.build_close_tx(self.closing.our_fee);
        let sig = self.secrets.commitkey.sign(close_tx.txid());
        info!("queue_pkt_close_signature: offered close fee {}", self.closing.our_fee);
        self.queue_pkt(PeerMessage::CloseSignature(CloseSignature {
            close_fee: self.closing.our_fee,
            sig,
        }));
    }

    pub fn queue_pkt_err(&mut self, problem: String) {
        warn!("Sending PKT_ERROR: {}", problem);
        self.queue_pkt(PeerMessage::Error(ErrorPacket { problem }));
    }

    fn queue_pkt_reconnect(&mut self) {
        let ack = self.their_order_count;
        self.queue_pkt(PeerMessage::Reconnect(Reconnect { ack }));
    }

    // ============================================================
    // Commitment transaction construction
    // ============================================================

    /// Build the commitment transaction for `side`'s chain from `cstate`
    /// and the HTLCs currently members of that commitment.
    fn build_commitment_tx(
        &self,
        cstate: &ChannelBalance,
        revocation_hash: &Hash256,
        side: Side,
    ) -> CommitmentTx {
        let anchor = self.anchor_info();
        let remote = self.remote();
        let (owner_final, other_final, owner_delay) = match side {
            // Our commitment: our main output is delayed by their locktime
            // and revocable with this commitment's revocation hash.
            Side::Ours => (
                &self.local.finalkey,
                &remote.finalkey,
                remote.locktime_blocks,
            ),
            Side::Theirs => (
                &remote.finalkey,
                &self.local.finalkey,
                self.local.locktime_blocks,
            ),
        };

        let mut outputs = Vec::new();
        let owner_sat = cstate.side(side).pay_msat / 1000;
        if !is_dust(owner_sat) {
            outputs.push(TxOut {
                sat: owner_sat,
                script: redeem_delayed(owner_final, revocation_hash, owner_delay),
            });
        }
        let other_sat = cstate.side(side.other()).pay_msat / 1000;
        if !is_dust(other_sat) {
            outputs.push(TxOut {
                sat: other_sat,
                script: redeem_simple(other_final),
            });
        }
        for htlc in self.htlcs.iter() {
            if !htlc.state.in_commitment(side) || is_dust(htlc.msat / 1000) {
                continue;
            }
            let (offerer, recipient) = match htlc.owner {
                HtlcSide::Local => (&self.local.finalkey, &remote.finalkey),
                HtlcSide::Remote => (&remote.finalkey, &self.local.finalkey),
            };
            outputs.push(TxOut {
                sat: htlc.msat / 1000,
                script: redeem_htlc(offerer, recipient, &htlc.rhash, htlc.expiry_blocks),
            });
        }
        permute_outputs(&mut outputs);
        CommitmentTx {
            anchor_txid: anchor.txid,
            anchor_index: anchor.output_index,
            outputs,
        }
    }

    /// The mutual close transaction at the given fee.
    fn build_close_tx(&self, fee_sat: u64) -> CommitmentTx {
        let anchor = self.anchor_info();
        let mut cstate = self
            .local
            .staging
            .clone()
            .expect("staging cstate exists for close");
        cstate.force_fee(fee_sat);
        let mut outputs = Vec::new();
        let ours_sat = cstate.side(Side::Ours).pay_msat / 1000;
        if !is_dust(ours_sat) {
            outputs.push(TxOut {
                sat: ours_sat,
                script: self.closing.our_script.clone().unwrap_or_default(),
            });
        }
        let theirs_sat = cstate.side(Side::Theirs).pay_msat / 1000;
        if !is_dust(theirs_sat) {
            outputs.push(TxOut {
                sat: theirs_sat,
                script: self.closing.their_script.clone().unwrap_or_default(),
            });
        }
        permute_outputs(&mut outputs);
        CommitmentTx {
            anchor_txid: anchor.txid,
            anchor_index: anchor.output_index,
            outputs,
        }
    }

    // ============================================================
    // Persistence helpers
    // ============================================================

    fn persist_htlc_transitions(
        &self,
        txn: &mut DbTransaction,
        transitions: &[(HtlcSide, u64, HtlcState, HtlcState)],
    ) -> ProcessingChannelResult {
        for (owner, id, old, new) in transitions {
            txn.update_htlc_state(&self.peer_id, *owner, *id, *old, *new)?;
        }
        Ok(())
    }

    fn commit_info_row(ci: &CommitInfo, prev: Option<Hash256>) -> CommitInfoRow {
        CommitInfoRow {
            commit_num: ci.commit_num,
            revocation_hash: ci.revocation_hash,
            xmit_order: ci.order,
            sig: ci.sig,
            prev_revocation_hash: prev,
        }
    }

    fn htlc_row(htlc: &Htlc) -> HtlcRow {
        HtlcRow {
            state: htlc.state,
            msat: htlc.msat,
            expiry_blocks: htlc.expiry_blocks,
            rhash: htlc.rhash,
            r: htlc.r,
            routing: htlc.routing.clone(),
            src: htlc.src,
        }
    }

    fn anchor_row(&self) -> AnchorRow {
        let anchor = self.anchor_info();
        AnchorRow {
            txid: anchor.txid,
            output_index: anchor.output_index,
            amount: anchor.satoshis,
            ok_depth: anchor.ok_depth,
            min_depth: anchor.min_depth,
            ours: anchor.ours,
        }
    }

    fn visible_row(&self) -> TheirVisibleRow {
        let remote = self.remote();
        TheirVisibleRow {
            offered_anchor: remote.offered_anchor,
            commitkey: remote.commitkey,
            finalkey: remote.finalkey,
            locktime_blocks: remote.locktime_blocks,
            mindepth: remote.mindepth,
            commit_fee_rate: remote.commit_fee_rate,
            next_revocation_hash: remote.next_revocation_hash,
        }
    }

    fn peer_row(&self) -> PeerRow {
        PeerRow {
            state: self.state,
            offered_anchor: self.local.offered_anchor,
            our_feerate: self.local.commit_fee_rate,
        }
    }

    fn set_state(&mut self, txn: &mut DbTransaction, state: ChannelState) {
        debug!("channel {}: {:?} -> {:?}", self.peer_id, self.state, state);
        self.state = state;
        txn.update_peer_state(&self.peer_id, &state);
    }

    // ============================================================
    // Opening
    // ============================================================

    /// Kick off an outbound open.
    pub fn initiate_open(&mut self) {
        if let ChannelState::NegotiatingOpen(ref mut flags) = self.state {
            if !flags.contains(NegotiatingOpenFlags::OUR_OPEN_SENT) {
                flags.insert(NegotiatingOpenFlags::OUR_OPEN_SENT);
                self.queue_pkt_open();
            }
        }
    }

    fn accept_pkt_open(
        &mut self,
        txn: &mut DbTransaction,
        config: &NodeConfig,
        pkt: Open,
    ) -> ProcessingChannelResult {
        let flags = match self.state {
            ChannelState::NegotiatingOpen(flags)
                if !flags.contains(NegotiatingOpenFlags::THEIR_OPEN_RECEIVED) =>
            {
                flags
            }
            _ => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Unexpected packet OPEN".to_string(),
                ))
            }
        };

        let delay_blocks = match pkt.delay {
            Locktime::Blocks(blocks) => blocks,
            Locktime::Seconds(_) => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Delay in seconds not accepted".to_string(),
                ))
            }
        };
        if delay_blocks > config.locktime_max() {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Delay too great".to_string(),
            ));
        }
        if pkt.min_depth > config.anchor_confirms_max() {
            return Err(ProcessingChannelError::ProtocolViolation(
                "min_depth too great".to_string(),
            ));
        }
        let feerate = config.fee_rate();
        if pkt.initial_fee_rate < feerate * config.commitment_fee_min_percent() / 100 {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Commitment fee rate too low".to_string(),
            ));
        }
        if pkt.initial_fee_rate > feerate * config.commitment_fee_max_percent() / 100 {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Commitment fee rate too high".to_string(),
            ));
        }
        let remote_offered_anchor = pkt.anchor_offer == AnchorOffer::WillCreateAnchor;
        if remote_offered_anchor == self.local.offered_anchor {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Only one side can offer anchor".to_string(),
            ));
        }

        self.remote = Some(SideState {
            commitkey: pkt.commit_key,
            finalkey: pkt.final_key,
            locktime_blocks: delay_blocks,
            mindepth: pkt.min_depth,
            commit_fee_rate: pkt.initial_fee_rate,
            next_revocation_hash: pkt.next_revocation_hash,
            offered_anchor: remote_offered_anchor,
            commit: CommitInfo::new(0, pkt.revocation_hash),
            staging: None,
        });

        let mut flags = flags | NegotiatingOpenFlags::THEIR_OPEN_RECEIVED;
        if !flags.contains(NegotiatingOpenFlags::OUR_OPEN_SENT) {
            flags.insert(NegotiatingOpenFlags::OUR_OPEN_SENT);
            self.queue_pkt_open();
        }
        self.state = ChannelState::NegotiatingOpen(flags);

        if flags.contains(NegotiatingOpenFlags::OPEN_EXCHANGED) {
            self.open_exchanged(txn)?;
        }
        Ok(())
    }

    /// Both OPEN packets are in: the channel exists. Create its rows, and
    /// if we are the funder, announce the anchor right away.
    fn open_exchanged(&mut self, txn: &mut DbTransaction) -> ProcessingChannelResult {
        self.state = ChannelState::AwaitingAnchor(AwaitingAnchorFlags::empty());
        txn.create_peer(
            &self.peer_id,
            &self.peer_row(),
            &self.secrets.clone(),
            &self.addr.clone(),
        );
        txn.set_visible_state(&self.peer_id, &self.visible_row());

        if self.local.offered_anchor {
            let funding = self
                .funding
                .take()
                .expect("funder has a funding outpoint");
            self.anchor = Some(AnchorInfo {
                txid: funding.txid,
                output_index: funding.output_index,
                satoshis: funding.amount,
                ours: true,
                min_depth: self.local.mindepth,
                ok_depth: 0,
            });
            self.setup_first_commits(txn)?;
            self.queue_pkt_anchor();
            self.state = ChannelState::AwaitingAnchor(AwaitingAnchorFlags::ANCHOR_SET);
            txn.update_peer_state(&self.peer_id, &self.state);
        }
        Ok(())
    }

    /// With the anchor known, both commitment chains start at commitment 0.
    fn setup_first_commits(&mut self, txn: &mut DbTransaction) -> ProcessingChannelResult {
        let anchor = self.anchor_info().clone();
        let funder = if self.local.offered_anchor {
            Side::Ours
        } else {
            Side::Theirs
        };

        let local_cstate = ChannelBalance::initial(anchor.satoshis, self.local.commit_fee_rate, funder)
            .ok_or_else(|| {
                ProcessingChannelError::ProtocolViolation("Invalid anchor amount".to_string())
            })?;
        let remote_rate = self.remote().commit_fee_rate;
        let remote_cstate = ChannelBalance::initial(anchor.satoshis, remote_rate, funder)
            .ok_or_else(|| {
                ProcessingChannelError::ProtocolViolation("Invalid anchor amount".to_string())
            })?;

        let local_revocation_hash = self.local.commit.revocation_hash;
        let local_tx = self.build_commitment_tx(&local_cstate, &local_revocation_hash, Side::Ours);
        self.local.commit.cstate = Some(local_cstate.clone());
        self.local.commit.tx = Some(local_tx);
        self.local.staging = Some(local_cstate);

        let remote_revocation_hash = self.remote().commit.revocation_hash;
        let remote_tx =
            self.build_commitment_tx(&remote_cstate, &remote_revocation_hash, Side::Theirs);
        let remote = self.remote_mut();
        remote.commit.cstate = Some(remote_cstate.clone());
        remote.commit.tx = Some(remote_tx);
        remote.staging = Some(remote_cstate);

        txn.set_anchor(&self.peer_id, &self.anchor_row());
        txn.new_commit_info(
            &self.peer_id,
            CommitSideTag::Ours,
            &Self::commit_info_row(&self.local.commit, None),
        );
        txn.new_commit_info(
            &self.peer_id,
            CommitSideTag::Theirs,
            &Self::commit_info_row(&self.remote().commit, None),
        );
        txn.save_shachain(&self.peer_id, &self.their_preimages);
        Ok(())
    }

    fn accept_pkt_anchor(
        &mut self,
        txn: &mut DbTransaction,
        pkt: OpenAnchor,
    ) -> ProcessingChannelResult {
        match self.state {
            ChannelState::AwaitingAnchor(flags)
                if !flags.contains(AwaitingAnchorFlags::ANCHOR_SET)
                    && !self.local.offered_anchor => {}
            _ => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Unexpected packet OPEN_ANCHOR".to_string(),
                ))
            }
        }

        self.anchor = Some(AnchorInfo {
            txid: pkt.txid,
            output_index: pkt.output_index,
            satoshis: pkt.amount,
            ours: false,
            min_depth: self.local.mindepth,
            ok_depth: 0,
        });
        self.setup_first_commits(txn)?;

        // Sign the funder's first commitment so it can safely broadcast the
        // anchor. We get no signature for ours until the first update.
        let remote_txid = self
            .remote()
            .commit
            .txid()
            .expect("remote commitment 0 built");
        let sig = self.secrets.commitkey.sign(remote_txid);
        self.remote_mut().commit.sig = Some(sig);
        txn.new_commit_info(
            &self.peer_id,
            CommitSideTag::Theirs,
            &Self::commit_info_row(&self.remote().commit, None),
        );
        self.queue_pkt_open_commit_sig();

        self.state = ChannelState::AwaitingAnchor(
            AwaitingAnchorFlags::ANCHOR_SET | AwaitingAnchorFlags::SIG_EXCHANGED,
        );
        txn.update_peer_state(&self.peer_id, &self.state);
        Ok(())
    }

    fn accept_pkt_open_commit_sig(
        &mut self,
        txn: &mut DbTransaction,
        pkt: OpenCommitSig,
    ) -> ProcessingChannelResult {
        let flags = match self.state {
            ChannelState::AwaitingAnchor(flags)
                if flags.contains(AwaitingAnchorFlags::ANCHOR_SET)
                    && !flags.contains(AwaitingAnchorFlags::SIG_EXCHANGED)
                    && self.local.offered_anchor =>
            {
                flags
            }
            _ => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Unexpected packet OPEN_COMMIT_SIG".to_string(),
                ))
            }
        };

        let local_txid = self.local.commit.txid().expect("local commitment 0 built");
        if !pkt.sig.verify(local_txid, &self.remote().commitkey) {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Bad signature".to_string(),
            ));
        }
        self.local.commit.sig = Some(pkt.sig);
        txn.new_commit_info(
            &self.peer_id,
            CommitSideTag::Ours,
            &Self::commit_info_row(&self.local.commit, None),
        );
        self.state =
            ChannelState::AwaitingAnchor(flags | AwaitingAnchorFlags::SIG_EXCHANGED);
        txn.update_peer_state(&self.peer_id, &self.state);
        Ok(())
    }

    fn accept_pkt_open_complete(&mut self, txn: &mut DbTransaction) -> ProcessingChannelResult {
        let flags = match self.state {
            ChannelState::AwaitingAnchor(flags) => flags,
            _ => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Unexpected packet OPEN_COMPLETE".to_string(),
                ))
            }
        };
        let flags = flags | AwaitingAnchorFlags::THEIR_COMPLETE_RECEIVED;
        self.state = ChannelState::AwaitingAnchor(flags);
        txn.update_peer_state(&self.peer_id, &self.state);
        self.maybe_channel_ready(txn);
        Ok(())
    }

    fn handle_anchor_confirmed(
        &mut self,
        txn: &mut DbTransaction,
        depth: u32,
    ) -> ProcessingChannelResult {
        let flags = match self.state {
            ChannelState::AwaitingAnchor(flags)
                if flags.contains(AwaitingAnchorFlags::ANCHOR_SET) =>
            {
                flags
            }
            // Depth notifications keep coming after NORMAL; nothing to do.
            ChannelState::ChannelReady | ChannelState::ShuttingDown(_) => return Ok(()),
            _ => {
                return Err(ProcessingChannelError::InvalidState(
                    "anchor depth event without anchor".to_string(),
                ))
            }
        };

        {
            let anchor = self.anchor.as_mut().expect("anchor known");
            anchor.ok_depth = depth;
        }
        txn.set_anchor(&self.peer_id, &self.anchor_row());

        let min_depth = self.anchor_info().min_depth;
        if depth >= min_depth
            && flags.contains(AwaitingAnchorFlags::SIG_EXCHANGED)
            && !flags.contains(AwaitingAnchorFlags::OUR_COMPLETE_SENT)
        {
            self.queue_pkt_open_complete();
            self.state = ChannelState::AwaitingAnchor(
                flags | AwaitingAnchorFlags::OUR_COMPLETE_SENT,
            );
            txn.update_peer_state(&self.peer_id, &self.state);
            self.maybe_channel_ready(txn);
        }
        Ok(())
    }

    fn maybe_channel_ready(&mut self, txn: &mut DbTransaction) {
        if let ChannelState::AwaitingAnchor(flags) = self.state {
            if flags.contains(AwaitingAnchorFlags::COMPLETE_EXCHANGED) {
                info!("channel {}: NORMAL operation", self.peer_id);
                self.set_state(txn, ChannelState::ChannelReady);
            }
        }
    }

    // ============================================================
    // HTLC commands (local intents)
    // ============================================================

    pub fn handle_command(
        &mut self,
        txn: &mut DbTransaction,
        command: ChannelCommand,
    ) -> ProcessingChannelResult {
        match command {
            ChannelCommand::AddHtlc(cmd) => self.handle_add_htlc_command(txn, cmd).map(|_| ()),
            ChannelCommand::FulfillHtlc { id, r } => self.handle_fulfill_command(txn, id, r),
            ChannelCommand::FailHtlc { id, reason } => self.handle_fail_command(txn, id, reason),
            ChannelCommand::AdjustFee { fee_rate } => self.handle_adjust_fee_command(txn, fee_rate),
            ChannelCommand::Shutdown => self.handle_shutdown_command(txn),
        }
    }

    pub fn handle_add_htlc_command(
        &mut self,
        txn: &mut DbTransaction,
        cmd: AddHtlcCommand,
    ) -> Result<u64, ProcessingChannelError> {
        if self.state != ChannelState::ChannelReady {
            return Err(ProcessingChannelError::InvalidState(format!(
                "cannot add HTLC in state {:?}",
                self.state
            )));
        }
        if cmd.msat == 0 {
            return Err(ProcessingChannelError::InvalidParameter(
                "Invalid amount_msat".to_string(),
            ));
        }
        if self
            .remote()
            .staging
            .as_ref()
            .expect("staging cstate exists")
            .side(Side::Ours)
            .num_htlcs
            >= MAX_HTLCS_IN_FLIGHT
        {
            return Err(ProcessingChannelError::CapacityRejection(
                "Too many HTLCs".to_string(),
            ));
        }

        let id = self.htlc_id_counter;
        let htlc = Htlc {
            id,
            owner: HtlcSide::Local,
            msat: cmd.msat,
            rhash: cmd.rhash,
            expiry_blocks: cmd.expiry_blocks,
            routing: cmd.routing,
            state: HtlcState::SentAddHtlc,
            r: None,
            src: cmd.src,
        };

        self.stage_add(&htlc).map_err(|_| {
            ProcessingChannelError::CapacityRejection("Cannot afford htlc".to_string())
        })?;

        self.htlc_id_counter += 1;
        txn.new_htlc(&self.peer_id, HtlcSide::Local, id, &Self::htlc_row(&htlc));
        self.htlcs.insert(htlc);
        self.queue_pkt_htlc_add(HtlcSide::Local, id);
        self.maybe_send_commit(txn)?;
        Ok(id)
    }

    /// Apply an add to both staging cstates, atomically: either both can
    /// afford it or neither is touched.
    fn stage_add(&mut self, htlc: &Htlc) -> Result<(), ()> {
        let mut local = self
            .local
            .staging
            .clone()
            .expect("staging cstate exists");
        if !local.add_htlc(htlc) {
            return Err(());
        }
        let mut remote = self
            .remote()
            .staging
            .clone()
            .expect("staging cstate exists");
        if !remote.add_htlc(htlc) {
            return Err(());
        }
        self.local.staging = Some(local);
        self.remote_mut().staging = Some(remote);
        Ok(())
    }

    fn stage_fulfill(&mut self, htlc: &Htlc) {
        self.local
            .staging
            .as_mut()
            .expect("staging cstate exists")
            .fulfill_htlc(htlc);
        self.remote_mut()
            .staging
            .as_mut()
            .expect("staging cstate exists")
            .fulfill_htlc(htlc);
    }

    fn stage_fail(&mut self, htlc: &Htlc) {
        self.local
            .staging
            .as_mut()
            .expect("staging cstate exists")
            .fail_htlc(htlc);
        self.remote_mut()
            .staging
            .as_mut()
            .expect("staging cstate exists")
            .fail_htlc(htlc);
    }

    fn handle_fulfill_command(
        &mut self,
        txn: &mut DbTransaction,
        id: u64,
        r: Preimage,
    ) -> ProcessingChannelResult {
        let htlc = match self.htlcs.get(HtlcSide::Remote, id) {
            Some(htlc) => htlc.clone(),
            None => {
                return Err(ProcessingChannelError::InvalidParameter(format!(
                    "Did not find HTLC {}",
                    id
                )))
            }
        };
        if htlc.state != HtlcState::RcvdAddAckRevocation {
            return Err(ProcessingChannelError::InvalidState(format!(
                "HTLC {} state {:?}",
                id, htlc.state
            )));
        }
        if r.hash() != htlc.rhash {
            return Err(ProcessingChannelError::InvalidParameter(format!(
                "Invalid r for {}",
                id
            )));
        }

        txn.htlc_fulfilled(&self.peer_id, HtlcSide::Remote, id, &r, htlc.state)?;
        txn.update_htlc_state(
            &self.peer_id,
            HtlcSide::Remote,
            id,
            htlc.state,
            HtlcState::SentRemoveHtlc,
        )?;
        self.stage_fulfill(&htlc);
        {
            let htlc = self
                .htlcs
                .get_mut(HtlcSide::Remote, id)
                .expect("checked above");
            htlc.r = Some(r);
            htlc.change_state(HtlcState::SentRemoveHtlc);
        }
        self.queue_pkt_htlc_fulfill(id, r);
        self.maybe_send_commit(txn)
    }

    fn handle_fail_command(
        &mut self,
        txn: &mut DbTransaction,
        id: u64,
        reason: Vec<u8>,
    ) -> ProcessingChannelResult {
        let htlc = match self.htlcs.get(HtlcSide::Remote, id) {
            Some(htlc) => htlc.clone(),
            None => {
                return Err(ProcessingChannelError::InvalidParameter(format!(
                    "Did not find HTLC {}",
                    id
                )))
            }
        };
        if htlc.state != HtlcState::RcvdAddAckRevocation {
            return Err(ProcessingChannelError::InvalidState(format!(
                "HTLC {} state {:?}",
                id, htlc.state
            )));
        }

        txn.update_htlc_state(
            &self.peer_id,
            HtlcSide::Remote,
            id,
            htlc.state,
            HtlcState::SentRemoveHtlc,
        )?;
        self.stage_fail(&htlc);
        self.htlcs
            .get_mut(HtlcSide::Remote, id)
            .expect("checked above")
            .change_state(HtlcState::SentRemoveHtlc);
        self.queue_pkt_htlc_fail(id, reason);
        self.maybe_send_commit(txn)
    }

    fn handle_adjust_fee_command(
        &mut self,
        txn: &mut DbTransaction,
        fee_rate: u64,
    ) -> ProcessingChannelResult {
        if self.state != ChannelState::ChannelReady {
            return Err(ProcessingChannelError::InvalidState(format!(
                "cannot change fee in state {:?}",
                self.state
            )));
        }
        self.local.commit_fee_rate = fee_rate;
        self.local
            .staging
            .as_mut()
            .expect("staging cstate exists")
            .adjust_fee(fee_rate);
        txn.update_our_feerate(&self.peer_id, fee_rate);
        self.queue_pkt(PeerMessage::UpdateFee(UpdateFee { fee_rate }));
        self.maybe_send_commit(txn)
    }

    fn handle_shutdown_command(&mut self, txn: &mut DbTransaction) -> ProcessingChannelResult {
        match self.state {
            ChannelState::ChannelReady => {}
            ChannelState::ShuttingDown(flags)
                if !flags.contains(ShuttingDownFlags::OUR_SHUTDOWN_SENT) => {}
            _ => {
                return Err(ProcessingChannelError::InvalidState(format!(
                    "cannot shut down in state {:?}",
                    self.state
                )))
            }
        }
        let script = shutdown_script(&self.local.finalkey);
        self.closing.our_script = Some(script);
        self.closing.shutdown_order = self.next_order();
        txn.save_closing(&self.peer_id, &self.closing);

        let flags = match self.state {
            ChannelState::ShuttingDown(flags) => flags | ShuttingDownFlags::OUR_SHUTDOWN_SENT,
            _ => ShuttingDownFlags::OUR_SHUTDOWN_SENT,
        };
        self.set_state(txn, ChannelState::ShuttingDown(flags));
        self.queue_pkt_close_shutdown();
        self.maybe_start_closing(txn)
    }

    // ============================================================
    // Peer packet dispatch
    // ============================================================

    pub fn handle_peer_message(
        &mut self,
        txn: &mut DbTransaction,
        config: &NodeConfig,
        message: PeerMessage,
    ) -> ProcessingChannelResult {
        if self.state.is_closed() {
            return Err(ProcessingChannelError::InvalidState(
                "channel is closed".to_string(),
            ));
        }
        if self.reestablishing
            && !matches!(message, PeerMessage::Reconnect(_) | PeerMessage::Error(_))
        {
            debug!("Ignoring message while reestablishing: {}", message);
            return Ok(());
        }
        match message {
            // Transport-level; the network actor consumed it already.
            PeerMessage::Init(_) => Ok(()),
            PeerMessage::Open(pkt) => self.accept_pkt_open(txn, config, pkt),
            PeerMessage::OpenAnchor(pkt) => self.accept_pkt_anchor(txn, pkt),
            PeerMessage::OpenCommitSig(pkt) => self.accept_pkt_open_commit_sig(txn, pkt),
            PeerMessage::OpenComplete(_) => self.accept_pkt_open_complete(txn),
            PeerMessage::UpdateAddHtlc(pkt) => {
                self.require_normal("UPDATE_ADD_HTLC", false)?;
                self.accept_pkt_htlc_add(txn, pkt)
            }
            PeerMessage::UpdateFulfillHtlc(pkt) => {
                self.require_normal("UPDATE_FULFILL_HTLC", true)?;
                self.accept_pkt_htlc_fulfill(txn, pkt)
            }
            PeerMessage::UpdateFailHtlc(pkt) => {
                self.require_normal("UPDATE_FAIL_HTLC", true)?;
                self.accept_pkt_htlc_fail(txn, pkt)
            }
            PeerMessage::UpdateCommit(pkt) => {
                self.require_normal("UPDATE_COMMIT", true)?;
                self.their_order_count += 1;
                self.accept_pkt_commit(txn, pkt)
            }
            PeerMessage::UpdateRevocation(pkt) => {
                self.require_normal("UPDATE_REVOCATION", true)?;
                self.their_order_count += 1;
                self.accept_pkt_revocation(txn, pkt)
            }
            PeerMessage::UpdateFee(pkt) => {
                self.require_normal("UPDATE_FEE", true)?;
                self.accept_pkt_fee(txn, pkt)
            }
            PeerMessage::CloseShutdown(pkt) => {
                self.require_normal("CLOSE_SHUTDOWN", true)?;
                self.their_order_count += 1;
                self.accept_pkt_close_shutdown(txn, pkt)
            }
            PeerMessage::CloseSignature(pkt) => {
                self.require_normal("CLOSE_SIGNATURE", true)?;
                self.their_order_count += 1;
                self.accept_pkt_close_signature(txn, pkt)
            }
            PeerMessage::Error(pkt) => {
                error!(
                    "channel {}: peer sent ERROR: {}",
                    self.peer_id, pkt.problem
                );
                self.state = ChannelState::Closed(CloseFlags::UNCOOPERATIVE);
                if txn.peer_exists(&self.peer_id) {
                    txn.update_peer_state(&self.peer_id, &self.state);
                }
                Ok(())
            }
            PeerMessage::Reconnect(pkt) => {
                self.accept_pkt_reconnect(pkt);
                Ok(())
            }
        }
    }

    fn require_normal(&self, pkt_name: &str, allow_shutdown: bool) -> ProcessingChannelResult {
        let ok = match self.state {
            ChannelState::ChannelReady => true,
            ChannelState::ShuttingDown(_) => allow_shutdown,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(ProcessingChannelError::ProtocolViolation(format!(
                "Unexpected packet {}",
                pkt_name
            )))
        }
    }

    // ============================================================
    // HTLC packet acceptors
    // ============================================================

    /// They add to both our staging cstate (as they did when they sent it)
    /// and theirs (as they will when we ack it).
    fn accept_pkt_htlc_add(
        &mut self,
        txn: &mut DbTransaction,
        pkt: UpdateAddHtlc,
    ) -> ProcessingChannelResult {
        if pkt.amount_msat == 0 {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Invalid amount_msat".to_string(),
            ));
        }
        let expiry_blocks = match pkt.expiry {
            Locktime::Blocks(blocks) => blocks,
            Locktime::Seconds(_) => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "HTLC expiry in seconds not supported!".to_string(),
                ))
            }
        };
        // A node must not offer more than MAX_HTLCS_IN_FLIGHT HTLCs in the
        // remote commitment transaction.
        if self
            .remote()
            .staging
            .as_ref()
            .expect("staging cstate exists")
            .side(Side::Theirs)
            .num_htlcs
            >= MAX_HTLCS_IN_FLIGHT
        {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Too many HTLCs".to_string(),
            ));
        }
        // Their problem if they reuse an id, but we detect and error for
        // them.
        if self.htlcs.get(HtlcSide::Remote, pkt.id).is_some() {
            return Err(ProcessingChannelError::ProtocolViolation(format!(
                "HTLC id {} clashes for you",
                pkt.id
            )));
        }

        let htlc = Htlc {
            id: pkt.id,
            owner: HtlcSide::Remote,
            msat: pkt.amount_msat,
            rhash: pkt.rhash,
            expiry_blocks,
            routing: pkt.route,
            state: HtlcState::RcvdAddHtlc,
            r: None,
            src: None,
        };
        self.stage_add(&htlc).map_err(|_| {
            ProcessingChannelError::ProtocolViolation("Cannot afford htlc".to_string())
        })?;
        txn.new_htlc(&self.peer_id, HtlcSide::Remote, pkt.id, &Self::htlc_row(&htlc));
        self.htlcs.insert(htlc);
        Ok(())
    }

    /// The id must name one of our HTLCs currently committed on both sides.
    fn find_committed_htlc(&self, id: u64) -> Result<Htlc, ProcessingChannelError> {
        let htlc = self
            .htlcs
            .get(HtlcSide::Local, id)
            .ok_or_else(|| {
                ProcessingChannelError::ProtocolViolation(format!("Did not find HTLC {}", id))
            })?
            .clone();
        if htlc.state != HtlcState::SentAddAckRevocation {
            return Err(ProcessingChannelError::ProtocolViolation(format!(
                "HTLC {} state {:?}",
                id, htlc.state
            )));
        }
        Ok(htlc)
    }

    fn accept_pkt_htlc_fulfill(
        &mut self,
        txn: &mut DbTransaction,
        pkt: UpdateFulfillHtlc,
    ) -> ProcessingChannelResult {
        let htlc = self.find_committed_htlc(pkt.id)?;

        // It must solve the HTLC rhash puzzle.
        if pkt.r.hash() != htlc.rhash {
            return Err(ProcessingChannelError::ProtocolViolation(format!(
                "Invalid r for {}",
                pkt.id
            )));
        }
        let was_already_fulfilled = htlc.r.is_some();
        if was_already_fulfilled {
            warn!("Duplicate fulfill for HTLC {}", pkt.id);
        } else {
            txn.htlc_fulfilled(&self.peer_id, HtlcSide::Local, pkt.id, &pkt.r, htlc.state)?;
        }

        txn.update_htlc_state(
            &self.peer_id,
            HtlcSide::Local,
            pkt.id,
            htlc.state,
            HtlcState::RcvdRemoveHtlc,
        )?;
        self.stage_fulfill(&htlc);
        {
            let htlc = self
                .htlcs
                .get_mut(HtlcSide::Local, pkt.id)
                .expect("found above");
            htlc.r = Some(pkt.r);
            htlc.change_state(HtlcState::RcvdRemoveHtlc);
        }
        // Settle the upstream HTLC we forwarded this one from.
        if let Some((peer, id)) = htlc.src {
            self.relay.push(RelayAction::FulfillUpstream { peer, id, r: pkt.r });
        }
        Ok(())
    }

    fn accept_pkt_htlc_fail(
        &mut self,
        txn: &mut DbTransaction,
        pkt: UpdateFailHtlc,
    ) -> ProcessingChannelResult {
        let htlc = self.find_committed_htlc(pkt.id)?;

        txn.update_htlc_state(
            &self.peer_id,
            HtlcSide::Local,
            pkt.id,
            htlc.state,
            HtlcState::RcvdRemoveHtlc,
        )?;
        self.stage_fail(&htlc);
        self.htlcs
            .get_mut(HtlcSide::Local, pkt.id)
            .expect("found above")
            .change_state(HtlcState::RcvdRemoveHtlc);
        if let Some((peer, id)) = htlc.src {
            self.relay.push(RelayAction::FailUpstream {
                peer,
                id,
                reason: pkt.reason,
            });
        }
        Ok(())
    }

    fn accept_pkt_fee(
        &mut self,
        txn: &mut DbTransaction,
        pkt: UpdateFee,
    ) -> ProcessingChannelResult {
        self.remote_mut().commit_fee_rate = pkt.fee_rate;
        self.remote_mut()
            .staging
            .as_mut()
            .expect("staging cstate exists")
            .adjust_fee(pkt.fee_rate);
        txn.update_their_commit_fee_rate(&self.peer_id, pkt.fee_rate);
        self.maybe_send_commit(txn)
    }

    // ============================================================
    // Commitment / revocation
    // ============================================================

    /// Send UPDATE_COMMIT when there is something to sign and the previous
    /// exchange has been revoked.
    fn maybe_send_commit(&mut self, txn: &mut DbTransaction) -> ProcessingChannelResult {
        if !matches!(
            self.state,
            ChannelState::ChannelReady | ChannelState::ShuttingDown(_)
        ) {
            return Ok(());
        }
        if self.reestablishing || self.their_prev_revocation_hash.is_some() {
            return Ok(());
        }
        let remote = self.remote();
        let changed = remote.staging.as_ref() != remote.commit.cstate.as_ref()
            || self.htlcs.any_advances_on(Step::SentCommit);
        if !changed {
            return Ok(());
        }
        self.send_commit(txn)
    }

    /// We are sending a signature for their pending changes: advance every
    /// HTLC waiting on our signature, mint their next commitment from
    /// remote staging, and remember the superseded revocation hash as the
    /// witness for their next UPDATE_REVOCATION.
    fn send_commit(&mut self, txn: &mut DbTransaction) -> ProcessingChannelResult {
        let transitions = self.htlcs.advance(Step::SentCommit);
        self.persist_htlc_transitions(txn, &transitions)?;

        let new_cstate = self
            .remote()
            .staging
            .clone()
            .expect("staging cstate exists");
        let revocation_hash = self.remote().next_revocation_hash;
        let tx = self.build_commitment_tx(&new_cstate, &revocation_hash, Side::Theirs);
        let txid = tx.txid();
        let sig = self.secrets.commitkey.sign(txid);
        let order = self.next_order();
        let prev_revocation_hash = self.remote().commit.revocation_hash;
        let commit_num = self.remote().commit.commit_num + 1;

        debug!(
            "send commit: their commitment {} (order {})",
            commit_num, order
        );
        {
            let remote = self.remote_mut();
            remote.commit = CommitInfo {
                commit_num,
                revocation_hash,
                order,
                sig: Some(sig),
                cstate: Some(new_cstate),
                tx: Some(tx),
            };
        }
        self.their_prev_revocation_hash = Some(prev_revocation_hash);

        txn.new_commit_info(
            &self.peer_id,
            CommitSideTag::Theirs,
            &Self::commit_info_row(&self.remote().commit, Some(prev_revocation_hash)),
        );
        txn.add_commit_map(&self.peer_id, &txid, commit_num);
        self.queue_pkt_commit(Some(sig));
        Ok(())
    }

    /// Their signature over our next commitment: verify it against the tx
    /// built from our staging cstate, mint the new local commitment and
    /// reply with the revocation preimage for the previous one.
    fn accept_pkt_commit(
        &mut self,
        txn: &mut DbTransaction,
        pkt: UpdateCommit,
    ) -> ProcessingChannelResult {
        let transitions = self.htlcs.advance(Step::RcvdCommit);
        self.persist_htlc_transitions(txn, &transitions)?;

        let new_cstate = self.local.staging.clone().expect("staging cstate exists");
        let commit_num = self.local.commit.commit_num + 1;
        let revocation_hash = self.local.next_revocation_hash;
        let tx = self.build_commitment_tx(&new_cstate, &revocation_hash, Side::Ours);
        let txid = tx.txid();

        let sig = match pkt.sig {
            Some(sig) => sig,
            None => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Expected signature".to_string(),
                ))
            }
        };
        if !sig.verify(txid, &self.remote().commitkey) {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Bad signature".to_string(),
            ));
        }

        debug!("accept commit: our commitment {}", commit_num);
        self.local.commit = CommitInfo {
            commit_num,
            revocation_hash,
            order: self.order_counter, // stamped below with the revocation
            sig: Some(sig),
            cstate: Some(new_cstate),
            tx: Some(tx),
        };
        self.local.next_revocation_hash =
            revocation_hash_from_seed(&self.secrets.revocation_seed, commit_num + 1);

        // The revocation preimage for the old commitment goes right back.
        self.local.commit.order = self.next_order();
        self.queue_pkt_revocation();
        let transitions = self.htlcs.advance(Step::SentRevocation);
        self.persist_htlc_transitions(txn, &transitions)?;

        txn.new_commit_info(
            &self.peer_id,
            CommitSideTag::Ours,
            &Self::commit_info_row(&self.local.commit, None),
        );

        self.maybe_start_closing(txn)?;
        self.maybe_send_commit(txn)
    }

    /// Their revocation preimage for the commitment our last UPDATE_COMMIT
    /// superseded.
    fn accept_pkt_revocation(
        &mut self,
        txn: &mut DbTransaction,
        pkt: UpdateRevocation,
    ) -> ProcessingChannelResult {
        let prev_hash = match self.their_prev_revocation_hash {
            Some(hash) => hash,
            None => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Unexpected packet UPDATE_REVOCATION".to_string(),
                ))
            }
        };

        let revoked_num = self.remote().commit.commit_num - 1;
        if pkt.revocation_preimage.hash() != prev_hash {
            warn!("Incorrect preimage for {}", revoked_num);
            return Err(ProcessingChannelError::ProtocolViolation(
                "complete preimage incorrect".to_string(),
            ));
        }

        // Preimages live at complement indices, in descending order.
        self.their_preimages
            .add_hash(u64::MAX - revoked_num, pkt.revocation_preimage.into())
            .map_err(|_| {
                ProcessingChannelError::ProtocolViolation(
                    "preimage not next in shachain".to_string(),
                )
            })?;
        debug!("Got revocation preimage {}", revoked_num);

        self.their_prev_revocation_hash = None;
        self.remote_mut().next_revocation_hash = pkt.next_revocation_hash;

        let transitions = self.htlcs.advance(Step::RcvdRevocation);
        self.persist_htlc_transitions(txn, &transitions)?;

        txn.save_shachain(&self.peer_id, &self.their_preimages);
        txn.remove_their_prev_revocation_hash(&self.peer_id);
        txn.update_next_revocation_hash(&self.peer_id, &pkt.next_revocation_hash);

        self.maybe_start_closing(txn)?;
        self.maybe_send_commit(txn)
    }

    // ============================================================
    // Mutual close
    // ============================================================

    fn accept_pkt_close_shutdown(
        &mut self,
        txn: &mut DbTransaction,
        pkt: CloseShutdown,
    ) -> ProcessingChannelResult {
        let flags = match self.state {
            ChannelState::ChannelReady => ShuttingDownFlags::empty(),
            ChannelState::ShuttingDown(flags)
                if !flags.contains(ShuttingDownFlags::THEIR_SHUTDOWN_SENT) =>
            {
                flags
            }
            _ => {
                return Err(ProcessingChannelError::ProtocolViolation(
                    "Unexpected packet CLOSE_SHUTDOWN".to_string(),
                ))
            }
        };
        self.closing.their_script = Some(pkt.script_pubkey);
        let mut flags = flags | ShuttingDownFlags::THEIR_SHUTDOWN_SENT;

        if !flags.contains(ShuttingDownFlags::OUR_SHUTDOWN_SENT) {
            self.closing.our_script = Some(shutdown_script(&self.local.finalkey));
            self.closing.shutdown_order = self.next_order();
            flags.insert(ShuttingDownFlags::OUR_SHUTDOWN_SENT);
            self.queue_pkt_close_shutdown();
        }
        txn.save_closing(&self.peer_id, &self.closing);
        self.set_state(txn, ChannelState::ShuttingDown(flags));
        self.maybe_start_closing(txn)
    }

    /// Once shutdown scripts are exchanged and every HTLC is resolved,
    /// offer a close fee.
    fn maybe_start_closing(&mut self, txn: &mut DbTransaction) -> ProcessingChannelResult {
        let flags = match self.state {
            ChannelState::ShuttingDown(flags) => flags,
            _ => return Ok(()),
        };
        if !flags.contains(ShuttingDownFlags::SHUTDOWN_EXCHANGED) {
            return Ok(());
        }
        if self.their_prev_revocation_hash.is_some() {
            return Ok(());
        }
        if self.htlcs.iter().any(|htlc| !htlc.state.is_resolved()) {
            return Ok(());
        }
        if self.closing.closing_order != -1 {
            return Ok(());
        }

        self.closing.our_fee = fee_by_rate(COMMITMENT_TX_BASE_BYTES, self.local.commit_fee_rate);
        self.closing.closing_order = self.next_order();
        txn.save_closing(&self.peer_id, &self.closing);
        self.queue_pkt_close_signature();
        Ok(())
    }

    fn accept_pkt_close_signature(
        &mut self,
        txn: &mut DbTransaction,
        pkt: CloseSignature,
    ) -> ProcessingChannelResult {
        if !matches!(self.state, ChannelState::ShuttingDown(_)) {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Unexpected packet CLOSE_SIGNATURE".to_string(),
            ));
        }

        let close_tx = self.build_close_tx(pkt.close_fee);
        if !pkt.sig.verify(close_tx.txid(), &self.remote().commitkey) {
            return Err(ProcessingChannelError::ProtocolViolation(
                "Bad close signature".to_string(),
            ));
        }
        self.closing.their_fee = pkt.close_fee;
        self.closing.their_sig = Some(pkt.sig);
        self.closing.sigs_in += 1;

        if self.closing.closing_order == -1 {
            // They offered first; adopt their fee outright.
            self.closing.our_fee = pkt.close_fee;
            self.closing.closing_order = self.next_order();
            txn.save_closing(&self.peer_id, &self.closing);
            self.queue_pkt_close_signature();
            self.finish_mutual_close(txn);
            return Ok(());
        }

        if pkt.close_fee == self.closing.our_fee {
            txn.save_closing(&self.peer_id, &self.closing);
            self.finish_mutual_close(txn);
            return Ok(());
        }

        // Converge: step to the (even) midpoint, or adopt their fee when
        // the midpoint stops moving.
        let midpoint = (self.closing.our_fee + pkt.close_fee) / 2 / 2 * 2;
        let new_fee = if midpoint == self.closing.our_fee {
            pkt.close_fee
        } else {
            midpoint
        };
        self.closing.our_fee = new_fee;
        self.closing.closing_order = self.next_order();
        txn.save_closing(&self.peer_id, &self.closing);
        self.queue_pkt_close_signature();
        if new_fee == pkt.close_fee {
            self.finish_mutual_close(txn);
        }
        Ok(())
    }

    fn finish_mutual_close(&mut self, txn: &mut DbTransaction) {
        info!(
            "channel {}: mutual close complete, fee {}",
            self.peer_id, self.closing.our_fee
        );
        self.set_state(txn, ChannelState::Closed(CloseFlags::COOPERATIVE));
    }

    // ============================================================
    // Reconnect
    // ============================================================

    fn accept_pkt_reconnect(&mut self, pkt: Reconnect) {
        debug!(
            "channel {}: reconnect, their ack {} (our order counter {})",
            self.peer_id, pkt.ack, self.order_counter
        );
        self.reestablishing = false;

        let mut ack = pkt.ack as i64;
        while ack < self.order_counter {
            if ack == self.local.commit.order {
                self.queue_pkt_revocation();
            } else if self.remote.is_some() && ack == self.remote().commit.order {
                self.requeue_commit_updates();
                let sig = self.remote().commit.sig;
                self.queue_pkt_commit(sig);
            } else if ack == self.closing.shutdown_order {
                self.queue_pkt_close_shutdown();
            } else if ack == self.closing.closing_order {
                self.queue_pkt_close_signature();
            }
            ack += 1;
        }

        // Updates not yet captured by any commitment also never reached
        // the peer's durable state; send them again ahead of any future
        // commit.
        self.requeue_staged_updates();
    }

    /// The update packets captured by the in-flight commitment.
    fn requeue_commit_updates(&mut self) {
        let updates: Vec<(HtlcSide, u64, HtlcState, Option<Preimage>)> = self
            .htlcs
            .iter()
            .filter(|htlc| {
                matches!(
                    htlc.state,
                    HtlcState::SentAddCommit | HtlcState::SentRemoveCommit
                )
            })
            .map(|htlc| (htlc.owner, htlc.id, htlc.state, htlc.r))
            .collect();
        for (owner, id, state, r) in updates {
            match state {
                HtlcState::SentAddCommit => self.queue_pkt_htlc_add(owner, id),
                HtlcState::SentRemoveCommit => match r {
                    Some(r) => self.queue_pkt_htlc_fulfill(id, r),
                    None => self.queue_pkt_htlc_fail(id, Vec::new()),
                },
                _ => unreachable!(),
            }
        }
    }

    fn requeue_staged_updates(&mut self) {
        let updates: Vec<(HtlcSide, u64, HtlcState, Option<Preimage>)> = self
            .htlcs
            .iter()
            .filter(|htlc| {
                matches!(
                    htlc.state,
                    HtlcState::SentAddHtlc | HtlcState::SentRemoveHtlc
                )
            })
            .map(|htlc| (htlc.owner, htlc.id, htlc.state, htlc.r))
            .collect();
        for (owner, id, state, r) in updates {
            match state {
                HtlcState::SentAddHtlc => self.queue_pkt_htlc_add(owner, id),
                HtlcState::SentRemoveHtlc => match r {
                    Some(r) => self.queue_pkt_htlc_fulfill(id, r),
                    None => self.queue_pkt_htlc_fail(id, Vec::new()),
                },
                _ => unreachable!(),
            }
        }
    }

    // ============================================================
    // Events
    // ============================================================

    pub fn handle_event(
        &mut self,
        txn: &mut DbTransaction,
        event: &ChannelEvent,
    ) -> ProcessingChannelResult {
        match event {
            ChannelEvent::AnchorConfirmed(depth) => self.handle_anchor_confirmed(txn, *depth),
            ChannelEvent::PeerConnected => {
                if self.state.is_anchor_ready() {
                    self.reestablishing = true;
                    self.queue_pkt_reconnect();
                }
                Ok(())
            }
            ChannelEvent::PeerDisconnected => {
                self.reestablishing = true;
                Ok(())
            }
            ChannelEvent::Stop(_) => Ok(()),
        }
    }

    // ============================================================
    // Restart reconstruction
    // ============================================================

    /// Rebuild the whole channel from its rows. HTLCs are replayed in id
    /// order over both initial cstates; commitment transactions, staging
    /// cstates and counters are all rederived.
    pub fn restore(
        store: &Store,
        config: &NodeConfig,
        local_node_id: Pubkey,
        peer_id: Pubkey,
    ) -> Result<ChannelActorState, String> {
        let peer_row = store
            .get_peer(&peer_id)
            .ok_or_else(|| format!("restore: no peer row for {}", peer_id))?;
        let secrets = store
            .get_secrets(&peer_id)
            .ok_or_else(|| format!("restore: no secrets for {}", peer_id))?;
        let addr = store
            .get_address(&peer_id)
            .ok_or_else(|| format!("restore: no address for {}", peer_id))?;

        let mut state = ChannelActorState::new(
            peer_id,
            local_node_id,
            addr,
            OpenChannelParams {
                commit_fee_rate: peer_row.our_feerate,
                locktime_blocks: config.locktime_blocks(),
                min_depth: config.anchor_confirms_min(),
                secrets,
                funding: None,
            },
        );
        state.state = peer_row.state;
        state.local.offered_anchor = peer_row.offered_anchor;
        state.closing = store.get_closing(&peer_id).unwrap_or_default();

        if peer_row.state.is_anchor_ready() {
            state.restore_anchor_state(store)?;
        }

        state.order_counter = 1 + [
            state.local.commit.order,
            state.remote.as_ref().map(|r| r.commit.order).unwrap_or(-1),
            state.closing.shutdown_order,
            state.closing.closing_order,
        ]
        .into_iter()
        .max()
        .expect("non-empty");

        Ok(state)
    }

    fn restore_anchor_state(&mut self, store: &Store) -> Result<(), String> {
        let peer_id = self.peer_id;
        let anchor_row = store
            .get_anchor(&peer_id)
            .ok_or_else(|| format!("restore: no anchor for {}", peer_id))?;
        let visible = store
            .get_their_visible_state(&peer_id)
            .ok_or_else(|| format!("restore: no visible state for {}", peer_id))?;
        self.their_preimages = store
            .get_shachain(&peer_id)
            .ok_or_else(|| format!("restore: no shachain for {}", peer_id))?;
        let ours_ci = store
            .get_commit_info(&peer_id, CommitSideTag::Ours)
            .ok_or_else(|| format!("restore: no local commit info for {}", peer_id))?;
        let theirs_ci = store
            .get_commit_info(&peer_id, CommitSideTag::Theirs)
            .ok_or_else(|| format!("restore: no remote commit info for {}", peer_id))?;

        self.anchor = Some(AnchorInfo {
            txid: anchor_row.txid,
            output_index: anchor_row.output_index,
            satoshis: anchor_row.amount,
            ours: anchor_row.ours,
            min_depth: anchor_row.min_depth,
            ok_depth: anchor_row.ok_depth,
        });
        self.their_prev_revocation_hash = theirs_ci.prev_revocation_hash;

        self.local.commit = CommitInfo {
            commit_num: ours_ci.commit_num,
            revocation_hash: ours_ci.revocation_hash,
            order: ours_ci.xmit_order,
            sig: ours_ci.sig,
            cstate: None,
            tx: None,
        };
        self.local.next_revocation_hash = revocation_hash_from_seed(
            &self.secrets.revocation_seed,
            ours_ci.commit_num + 1,
        );
        self.remote = Some(SideState {
            commitkey: visible.commitkey,
            finalkey: visible.finalkey,
            locktime_blocks: visible.locktime_blocks,
            mindepth: visible.mindepth,
            commit_fee_rate: visible.commit_fee_rate,
            next_revocation_hash: visible.next_revocation_hash,
            offered_anchor: visible.offered_anchor,
            commit: CommitInfo {
                commit_num: theirs_ci.commit_num,
                revocation_hash: theirs_ci.revocation_hash,
                order: theirs_ci.xmit_order,
                sig: theirs_ci.sig,
                cstate: None,
                tx: None,
            },
            staging: None,
        });

        // We rebuild cstates by running *every* HTLC through. Slow, but
        // sure.
        let funder = if self.local.offered_anchor {
            Side::Ours
        } else {
            Side::Theirs
        };
        let mut local_cstate =
            ChannelBalance::initial(anchor_row.amount, self.local.commit_fee_rate, funder)
                .ok_or("restore: bad local initial cstate")?;
        let mut remote_cstate =
            ChannelBalance::initial(anchor_row.amount, visible.commit_fee_rate, funder)
                .ok_or("restore: bad remote initial cstate")?;

        for (owner, id, row) in store.get_htlcs(&peer_id) {
            let htlc = Htlc {
                id,
                owner,
                msat: row.msat,
                rhash: row.rhash,
                expiry_blocks: row.expiry_blocks,
                routing: row.routing.clone(),
                state: row.state,
                r: row.r,
                src: row.src,
            };
            debug!(
                "Loaded {:?} HTLC {} ({:?})",
                owner, id, row.state
            );
            if owner == HtlcSide::Local && id >= self.htlc_id_counter {
                self.htlc_id_counter = id + 1;
            }

            if htlc.state.was_in_commitment(Side::Ours) {
                if !local_cstate.add_htlc(&htlc) {
                    return Err("restore: can't add local HTLC".to_string());
                }
                if !htlc.state.in_commitment(Side::Ours) {
                    htlc_resolved(&mut local_cstate, &htlc);
                }
            }
            if htlc.state.was_in_commitment(Side::Theirs) {
                if !remote_cstate.add_htlc(&htlc) {
                    return Err("restore: can't add remote HTLC".to_string());
                }
                if !htlc.state.in_commitment(Side::Theirs) {
                    htlc_resolved(&mut remote_cstate, &htlc);
                }
            }
            self.htlcs.insert(htlc);
        }

        let local_tx =
            self.build_commitment_tx(&local_cstate, &self.local.commit.revocation_hash, Side::Ours);
        self.local.commit.cstate = Some(local_cstate.clone());
        self.local.commit.tx = Some(local_tx);
        self.local.staging = Some(local_cstate);

        let remote_revocation_hash = self.remote().commit.revocation_hash;
        let remote_tx =
            self.build_commitment_tx(&remote_cstate, &remote_revocation_hash, Side::Theirs);
        {
            let remote = self.remote_mut();
            remote.commit.cstate = Some(remote_cstate.clone());
            remote.commit.tx = Some(remote_tx);
            remote.staging = Some(remote_cstate);
        }

        // How many order-stamped packets of theirs we had processed:
        // commits and revocations are implied by the chain heads, shutdown
        // and closing signatures by the closing row.
        let commits_received = self.local.commit.commit_num;
        let revocations_received = self
            .remote()
            .commit
            .commit_num
            .saturating_sub(self.their_prev_revocation_hash.is_some() as u64);
        let shutdown_received = self.closing.their_script.is_some() as u64;
        self.their_order_count = commits_received
            + revocations_received
            + shutdown_received
            + self.closing.sigs_in as u64;
        Ok(())
    }
}

/// An HTLC no longer committed is either resolved or failed.
fn htlc_resolved(cstate: &mut ChannelBalance, htlc: &Htlc) {
    if htlc.r.is_some() {
        cstate.fulfill_htlc(htlc);
    } else {
        cstate.fail_htlc(htlc);
    }
}

/// Our revocation hash for commitment `commit_num`, derived from the seed.
pub fn revocation_hash_from_seed(seed: &[u8; 32], commit_num: u64) -> Hash256 {
    sha256(shachain_from_seed(seed, u64::MAX - commit_num))
}

// ============================================================
// The actor
// ============================================================

pub struct ChannelActor {
    store: Store,
    network: ActorRef<NetworkActorMessage>,
    config: NodeConfig,
}

impl ChannelActor {
    pub fn new(store: Store, network: ActorRef<NetworkActorMessage>, config: NodeConfig) -> Self {
        ChannelActor {
            store,
            network,
            config,
        }
    }

    fn flush(&self, state: &mut ChannelActorState) {
        for message in state.take_outpkt() {
            self.network
                .send_message(NetworkActorMessage::Command(
                    NetworkActorCommand::SendPeerMessage(PeerMessageWithId {
                        peer_id: state.peer_id,
                        message,
                    }),
                ))
                .expect(ASSUME_NETWORK_ACTOR_ALIVE);
        }
        for action in state.take_relay() {
            self.network
                .send_message(NetworkActorMessage::Command(NetworkActorCommand::Relay(
                    action,
                )))
                .expect(ASSUME_NETWORK_ACTOR_ALIVE);
        }
    }

    /// Persist CLOSED, then drop every row of the peer.
    fn forget_peer(&self, state: &mut ChannelActorState) {
        if self.store.get_peer(&state.peer_id).is_some() {
            let mut txn = self.store.begin_transaction();
            txn.update_peer_state(&state.peer_id, &state.state);
            if let Err(e) = txn.commit() {
                error!("persisting CLOSED failed: {}", e);
                return;
            }
            let mut txn = self.store.begin_transaction();
            txn.forget_peer(&state.peer_id);
            if let Err(e) = txn.commit() {
                error!("forget_peer failed: {}", e);
            }
        }
        self.network
            .send_message(NetworkActorMessage::Command(
                NetworkActorCommand::ChannelClosed(state.peer_id),
            ))
            .expect(ASSUME_NETWORK_ACTOR_ALIVE);
    }

    fn on_peer_message(
        &self,
        myself: &ActorRef<ChannelActorMessage>,
        state: &mut ChannelActorState,
        message: PeerMessage,
    ) {
        let mut txn = self.store.begin_transaction();
        match state.handle_peer_message(&mut txn, &self.config, message) {
            Ok(()) => {
                if let Err(e) = txn.commit() {
                    error!("db commit failed: {}", e);
                    state.state = ChannelState::Closed(CloseFlags::UNCOOPERATIVE);
                    self.forget_peer(state);
                    myself.stop(Some("storage failure".to_string()));
                    return;
                }
                self.flush(state);
                if state.state.is_closed() {
                    self.forget_peer(state);
                    myself.stop(Some("channel closed".to_string()));
                }
            }
            Err(err) => {
                txn.abort();
                error!(
                    "channel {}: failed processing peer message: {}",
                    state.peer_id, err
                );
                if !err.is_fatal() {
                    state.queue_pkt_err(err.wire_problem());
                }
                self.flush(state);
                state.state = ChannelState::Closed(CloseFlags::UNCOOPERATIVE);
                self.forget_peer(state);
                myself.stop(Some("channel failed".to_string()));
            }
        }
    }

    fn on_command(&self, state: &mut ChannelActorState, command: ChannelCommand) {
        let mut txn = self.store.begin_transaction();
        match state.handle_command(&mut txn, command) {
            Ok(()) => {
                if let Err(e) = txn.commit() {
                    error!("db commit failed: {}", e);
                    return;
                }
                self.flush(state);
            }
            Err(err) => {
                // A rejected command fails only the command; the channel
                // carries on.
                txn.abort();
                warn!("channel {}: command rejected: {}", state.peer_id, err);
            }
        }
    }

    fn on_event(
        &self,
        myself: &ActorRef<ChannelActorMessage>,
        state: &mut ChannelActorState,
        event: ChannelEvent,
    ) {
        if let ChannelEvent::Stop(reason) = &event {
            debug!("channel {}: stopping ({:?})", state.peer_id, reason);
            myself.stop(Some(format!("{:?}", reason)));
            return;
        }
        let mut txn = self.store.begin_transaction();
        match state.handle_event(&mut txn, &event) {
            Ok(()) => {
                if let Err(e) = txn.commit() {
                    error!("db commit failed: {}", e);
                    return;
                }
                self.flush(state);
            }
            Err(err) => {
                txn.abort();
                warn!("channel {}: event ignored: {}", state.peer_id, err);
            }
        }
    }
}

/// How a channel actor comes to life.
pub enum ChannelInitializationParams {
    /// We initiate: send OPEN as soon as the actor starts.
    OpenChannel {
        peer_id: Pubkey,
        local_node_id: Pubkey,
        addr: SocketAddr,
        params: OpenChannelParams,
    },
    /// The peer initiated: process their OPEN and answer it.
    AcceptChannel {
        peer_id: Pubkey,
        local_node_id: Pubkey,
        addr: SocketAddr,
        params: OpenChannelParams,
        open: Open,
    },
    /// Reconstructed from the store at startup.
    Restored(Box<ChannelActorState>),
}

#[async_trait::async_trait]
impl Actor for ChannelActor {
    type Msg = ChannelActorMessage;
    type State = ChannelActorState;
    type Arguments = ChannelInitializationParams;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        match args {
            ChannelInitializationParams::OpenChannel {
                peer_id,
                local_node_id,
                addr,
                params,
            } => {
                let mut state = ChannelActorState::new(peer_id, local_node_id, addr, params);
                state.initiate_open();
                self.flush(&mut state);
                Ok(state)
            }
            ChannelInitializationParams::AcceptChannel {
                peer_id,
                local_node_id,
                addr,
                params,
                open,
            } => {
                let mut state = ChannelActorState::new(peer_id, local_node_id, addr, params);
                let mut txn = self.store.begin_transaction();
                match state.handle_peer_message(&mut txn, &self.config, PeerMessage::Open(open)) {
                    Ok(()) => {
                        txn.commit().map_err(ActorProcessingErr::from)?;
                        self.flush(&mut state);
                        Ok(state)
                    }
                    Err(err) => {
                        txn.abort();
                        if !err.is_fatal() {
                            state.queue_pkt_err(err.wire_problem());
                        }
                        self.flush(&mut state);
                        Err(ActorProcessingErr::from(err.to_string()))
                    }
                }
            }
            ChannelInitializationParams::Restored(state) => Ok(*state),
        }
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ChannelActorMessage::PeerMessage(message) => {
                self.on_peer_message(&myself, state, message)
            }
            ChannelActorMessage::Command(command) => self.on_command(state, command),
            ChannelActorMessage::Event(event) => self.on_event(&myself, state, event),
        }
        Ok(())
    }
}
