use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cstate::Side;
use super::types::{Hash256, Preimage, Pubkey};

/// Which party offered an HTLC.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HtlcSide {
    Local,
    Remote,
}

impl HtlcSide {
    pub fn other(self) -> HtlcSide {
        match self {
            HtlcSide::Local => HtlcSide::Remote,
            HtlcSide::Remote => HtlcSide::Local,
        }
    }

    /// The balance side that pays for an HTLC offered by this party.
    pub fn cstate_side(self) -> Side {
        match self {
            HtlcSide::Local => Side::Ours,
            HtlcSide::Remote => Side::Theirs,
        }
    }
}

/// The four protocol events that move HTLCs along their ladders. Every
/// event advances a fixed set of states by exactly one step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// We queued an UPDATE_COMMIT.
    SentCommit,
    /// We accepted their UPDATE_REVOCATION.
    RcvdRevocation,
    /// We accepted their UPDATE_COMMIT.
    RcvdCommit,
    /// We queued an UPDATE_REVOCATION.
    SentRevocation,
}

/// Position of an HTLC in its lifecycle. Four ladders of five states:
/// adds we offered, adds they offered, removals they asked for (of HTLCs we
/// offered) and removals we asked for (of HTLCs they offered). The add
/// ladders end "committed on both sides"; the removal ladders start from
/// there and end fully resolved.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HtlcState {
    // We offered the HTLC.
    SentAddHtlc,
    SentAddCommit,
    RcvdAddRevocation,
    RcvdAddAckCommit,
    SentAddAckRevocation,

    // They offered the HTLC.
    RcvdAddHtlc,
    RcvdAddCommit,
    SentAddRevocation,
    SentAddAckCommit,
    RcvdAddAckRevocation,

    // We sent the removal (fulfill or fail of an HTLC they offered).
    SentRemoveHtlc,
    SentRemoveCommit,
    RcvdRemoveRevocation,
    RcvdRemoveAckCommit,
    SentRemoveAckRevocation,

    // They sent the removal (of an HTLC we offered).
    RcvdRemoveHtlc,
    RcvdRemoveCommit,
    SentRemoveRevocation,
    SentRemoveAckCommit,
    RcvdRemoveAckRevocation,
}

use HtlcState::*;

impl HtlcState {
    pub const ALL: [HtlcState; 20] = [
        SentAddHtlc,
        SentAddCommit,
        RcvdAddRevocation,
        RcvdAddAckCommit,
        SentAddAckRevocation,
        RcvdAddHtlc,
        RcvdAddCommit,
        SentAddRevocation,
        SentAddAckCommit,
        RcvdAddAckRevocation,
        SentRemoveHtlc,
        SentRemoveCommit,
        RcvdRemoveRevocation,
        RcvdRemoveAckCommit,
        SentRemoveAckRevocation,
        RcvdRemoveHtlc,
        RcvdRemoveCommit,
        SentRemoveRevocation,
        SentRemoveAckCommit,
        RcvdRemoveAckRevocation,
    ];

    /// Which party owns (offered) an HTLC in this state. Removals are always
    /// sent by the side the HTLC was offered to, so the SentRemove ladder
    /// belongs to their HTLCs and the RcvdRemove ladder to ours.
    pub fn owner(self) -> HtlcSide {
        match self {
            SentAddHtlc | SentAddCommit | RcvdAddRevocation | RcvdAddAckCommit
            | SentAddAckRevocation => HtlcSide::Local,
            RcvdAddHtlc | RcvdAddCommit | SentAddRevocation | SentAddAckCommit
            | RcvdAddAckRevocation => HtlcSide::Remote,
            SentRemoveHtlc | SentRemoveCommit | RcvdRemoveRevocation | RcvdRemoveAckCommit
            | SentRemoveAckRevocation => HtlcSide::Remote,
            RcvdRemoveHtlc | RcvdRemoveCommit | SentRemoveRevocation | SentRemoveAckCommit
            | RcvdRemoveAckRevocation => HtlcSide::Local,
        }
    }

    /// The single successor on the ladder, if any.
    pub fn next(self) -> Option<HtlcState> {
        match self {
            SentAddHtlc => Some(SentAddCommit),
            SentAddCommit => Some(RcvdAddRevocation),
            RcvdAddRevocation => Some(RcvdAddAckCommit),
            RcvdAddAckCommit => Some(SentAddAckRevocation),
            SentAddAckRevocation => None,

            RcvdAddHtlc => Some(RcvdAddCommit),
            RcvdAddCommit => Some(SentAddRevocation),
            SentAddRevocation => Some(SentAddAckCommit),
            SentAddAckCommit => Some(RcvdAddAckRevocation),
            RcvdAddAckRevocation => None,

            SentRemoveHtlc => Some(SentRemoveCommit),
            SentRemoveCommit => Some(RcvdRemoveRevocation),
            RcvdRemoveRevocation => Some(RcvdRemoveAckCommit),
            RcvdRemoveAckCommit => Some(SentRemoveAckRevocation),
            SentRemoveAckRevocation => None,

            RcvdRemoveHtlc => Some(RcvdRemoveCommit),
            RcvdRemoveCommit => Some(SentRemoveRevocation),
            SentRemoveRevocation => Some(SentRemoveAckCommit),
            SentRemoveAckCommit => Some(RcvdRemoveAckRevocation),
            RcvdRemoveAckRevocation => None,
        }
    }

    /// The successor reached by `step`, if this state advances on it.
    pub fn next_on(self, step: Step) -> Option<HtlcState> {
        let advances = match step {
            Step::SentCommit => matches!(
                self,
                SentAddHtlc | SentAddRevocation | SentRemoveHtlc | SentRemoveRevocation
            ),
            Step::RcvdRevocation => matches!(
                self,
                SentAddCommit | SentAddAckCommit | SentRemoveCommit | SentRemoveAckCommit
            ),
            Step::RcvdCommit => matches!(
                self,
                RcvdAddHtlc | RcvdAddRevocation | RcvdRemoveHtlc | RcvdRemoveRevocation
            ),
            Step::SentRevocation => matches!(
                self,
                RcvdAddCommit | RcvdAddAckCommit | RcvdRemoveCommit | RcvdRemoveAckCommit
            ),
        };
        if advances {
            self.next()
        } else {
            None
        }
    }

    /// Whether the HTLC is currently an output of the given side's
    /// commitment transaction.
    pub fn in_commitment(self, side: Side) -> bool {
        match side {
            Side::Ours => matches!(
                self,
                RcvdAddAckCommit
                    | SentAddAckRevocation
                    | RcvdAddCommit
                    | SentAddRevocation
                    | SentAddAckCommit
                    | RcvdAddAckRevocation
                    | SentRemoveHtlc
                    | SentRemoveCommit
                    | RcvdRemoveRevocation
                    | RcvdRemoveHtlc
            ),
            Side::Theirs => matches!(
                self,
                SentAddCommit
                    | RcvdAddRevocation
                    | RcvdAddAckCommit
                    | SentAddAckRevocation
                    | SentAddAckCommit
                    | RcvdAddAckRevocation
                    | SentRemoveHtlc
                    | RcvdRemoveHtlc
                    | RcvdRemoveCommit
                    | SentRemoveRevocation
            ),
        }
    }

    /// Whether the HTLC was ever an output of the given commitment. Drives
    /// the replay on restart: HTLCs that were committed get re-applied, and
    /// resolved again if no longer committed.
    pub fn was_in_commitment(self, side: Side) -> bool {
        if self.in_commitment(side) {
            return true;
        }
        match side {
            Side::Ours => matches!(
                self,
                RcvdRemoveCommit
                    | SentRemoveRevocation
                    | SentRemoveAckCommit
                    | RcvdRemoveAckRevocation
                    | SentRemoveAckRevocation
                    | RcvdRemoveAckCommit
            ),
            Side::Theirs => matches!(
                self,
                SentRemoveCommit
                    | RcvdRemoveRevocation
                    | RcvdRemoveAckCommit
                    | SentRemoveAckRevocation
                    | SentRemoveAckCommit
                    | RcvdRemoveAckRevocation
            ),
        }
    }

    /// Both sides have revocation-acknowledged the removal.
    pub fn is_resolved(self) -> bool {
        matches!(self, SentRemoveAckRevocation | RcvdRemoveAckRevocation)
    }

    /// Ladder adjacency, plus the two removal entry points reachable from
    /// the fully-committed terminals.
    pub fn can_transition_to(self, to: HtlcState) -> bool {
        self.next() == Some(to)
            || matches!(
                (self, to),
                (SentAddAckRevocation, RcvdRemoveHtlc) | (RcvdAddAckRevocation, SentRemoveHtlc)
            )
    }

    /// Committed on both sides and not being removed.
    pub fn is_fully_committed(self) -> bool {
        matches!(self, SentAddAckRevocation | RcvdAddAckRevocation)
    }
}

/// A Hashed Time-Locked Contract riding on the channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Htlc {
    /// Unique within (channel, owner). Locally offered ids come from the
    /// per-peer monotonic counter.
    pub id: u64,
    pub owner: HtlcSide,
    pub msat: u64,
    pub rhash: Hash256,
    /// Absolute expiry, as a block height.
    pub expiry_blocks: u32,
    /// Opaque routing blob, forwarded as-is.
    pub routing: Vec<u8>,
    pub state: HtlcState,
    /// The payment preimage, once known.
    pub r: Option<Preimage>,
    /// Upstream HTLC this one was forwarded from: (peer id, htlc id) on that
    /// peer's channel, resolved through the peer map, never a direct
    /// reference.
    pub src: Option<(Pubkey, u64)>,
}

impl Htlc {
    pub fn cstate_side(&self) -> Side {
        self.owner.cstate_side()
    }

    /// Move to an adjacent state. Anything else is a programming error.
    pub fn change_state(&mut self, new_state: HtlcState) {
        assert!(
            self.state.can_transition_to(new_state),
            "illegal HTLC state change {:?} -> {:?}",
            self.state,
            new_state,
        );
        assert_eq!(self.state.owner(), new_state.owner());
        self.state = new_state;
    }
}

/// All HTLCs of one channel, keyed by (owner, id), iterable in id order.
#[derive(Debug, Default, Clone)]
pub struct HtlcRegistry {
    htlcs: BTreeMap<(u64, HtlcSide), Htlc>,
}

impl HtlcRegistry {
    pub fn insert(&mut self, htlc: Htlc) -> &Htlc {
        let key = (htlc.id, htlc.owner);
        assert!(
            !self.htlcs.contains_key(&key),
            "duplicate HTLC {:?}",
            key
        );
        self.htlcs.entry(key).or_insert(htlc)
    }

    pub fn get(&self, owner: HtlcSide, id: u64) -> Option<&Htlc> {
        self.htlcs.get(&(id, owner))
    }

    pub fn get_mut(&mut self, owner: HtlcSide, id: u64) -> Option<&mut Htlc> {
        self.htlcs.get_mut(&(id, owner))
    }

    /// All HTLCs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Htlc> {
        self.htlcs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Htlc> {
        self.htlcs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.htlcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.htlcs.is_empty()
    }

    /// Advance every HTLC that moves on `step`, returning the transitions
    /// performed so each can be mirrored to the store with its state guard.
    pub fn advance(&mut self, step: Step) -> Vec<(HtlcSide, u64, HtlcState, HtlcState)> {
        let mut changed = Vec::new();
        for htlc in self.htlcs.values_mut() {
            if let Some(next) = htlc.state.next_on(step) {
                let old = htlc.state;
                htlc.change_state(next);
                changed.push((htlc.owner, htlc.id, old, next));
            }
        }
        changed
    }

    /// Is there anything a new commitment from us would capture?
    pub fn any_advances_on(&self, step: Step) -> bool {
        self.htlcs
            .values()
            .any(|htlc| htlc.state.next_on(step).is_some())
    }
}
