use serde::{Deserialize, Serialize};

use super::fee::{commitment_fee_msat, is_dust};
use super::htlc::Htlc;

/// Which party a balance side, a commitment chain or an anchor offer belongs
/// to, from the local node's point of view.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    /// Output for us; HTLCs we offered to them.
    Ours,
    /// Output for them; HTLCs they offered to us.
    Theirs,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Ours => Side::Theirs,
            Side::Theirs => Side::Ours,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Ours => 0,
            Side::Theirs => 1,
        }
    }
}

/// One party's slice of a commitment: payable balance, fee contribution and
/// the number of HTLCs it currently offers. Amounts are milli-satoshi.
#[derive(Debug, Default, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceSide {
    pub pay_msat: u64,
    pub fee_msat: u64,
    pub num_htlcs: u32,
}

/// The pure value of one commitment transaction: anchor amount, fee rate,
/// non-dust HTLC count and both parties' balances.
///
/// Invariant: `anchor_sat * 1000 == sum(pay_msat) + sum(fee_msat)`; the
/// difference to the anchor is held by in-flight HTLC values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelBalance {
    /// Satoshis locked by the anchor.
    pub anchor_sat: u64,
    /// Satoshis per 1000 bytes.
    pub fee_rate: u64,
    /// Number of non-dust HTLCs, which drives the commitment tx size.
    pub num_nondust: u32,
    sides: [BalanceSide; 2],
}

impl ChannelBalance {
    /// Given the anchor and initial fee rate, the state of commitment 0:
    /// everything pays back to the funder, which also carries the whole fee.
    /// Returns `None` when the anchor cannot fit a 32-bit satoshi amount or
    /// cannot cover the base fee.
    pub fn initial(anchor_sat: u64, fee_rate: u64, funder: Side) -> Option<Self> {
        // Anchor must fit in 32 bit once expressed in msat.
        if anchor_sat >= (1u64 << 32) / 1000 {
            return None;
        }

        let fee_msat = commitment_fee_msat(0, fee_rate);
        if fee_msat > anchor_sat * 1000 {
            return None;
        }

        let mut cstate = ChannelBalance {
            anchor_sat,
            fee_rate,
            num_nondust: 0,
            sides: [BalanceSide::default(); 2],
        };
        cstate.side_mut(funder).pay_msat = anchor_sat * 1000 - fee_msat;
        cstate.side_mut(funder).fee_msat = fee_msat;

        // Running the fee split over the fresh state must keep the whole fee
        // on the funder, since the fundee has nothing to pay with.
        let ok = cstate.change_funding(0, funder, 0);
        debug_assert!(ok);
        debug_assert_eq!(cstate.side(funder).fee_msat, fee_msat);
        debug_assert_eq!(cstate.side(funder.other()).fee_msat, 0);

        Some(cstate)
    }

    pub fn side(&self, side: Side) -> &BalanceSide {
        &self.sides[side.index()]
    }

    pub fn side_mut(&mut self, side: Side) -> &mut BalanceSide {
        &mut self.sides[side.index()]
    }

    /// Append an HTLC offered by its owner side, if that side can afford
    /// both the HTLC value and its half of the recomputed fee. On `false`
    /// the state is unchanged.
    pub fn add_htlc(&mut self, htlc: &Htlc) -> bool {
        let creator = htlc.cstate_side();

        // The new HTLC counts toward the tx size unless it is dust.
        let mut nondust = self.num_nondust;
        if !is_dust(htlc.msat / 1000) {
            nondust += 1;
        }

        if !self.change_funding(htlc.msat as i64, creator, nondust) {
            return false;
        }
        self.side_mut(creator).num_htlcs += 1;
        true
    }

    /// Remove an HTLC, refunding its value to the side which offered it.
    pub fn fail_htlc(&mut self, htlc: &Htlc) {
        self.remove_htlc(htlc, htlc.cstate_side());
    }

    /// Remove an HTLC, crediting its value to the side it was offered to.
    pub fn fulfill_htlc(&mut self, htlc: &Htlc) {
        self.remove_htlc(htlc, htlc.cstate_side().other());
    }

    fn remove_htlc(&mut self, htlc: &Htlc, beneficiary: Side) {
        let creator = htlc.cstate_side();

        let mut nondust = self.num_nondust;
        if !is_dust(htlc.msat / 1000) {
            assert!(nondust > 0);
            nondust -= 1;
        }

        // Cannot fail: the amount is a credit.
        let ok = self.change_funding(-(htlc.msat as i64), beneficiary, nondust);
        assert!(ok, "removing an HTLC cannot fail");

        assert!(self.side(creator).num_htlcs > 0);
        self.side_mut(creator).num_htlcs -= 1;
    }

    /// Change the fee rate and redistribute the fee accordingly.
    pub fn adjust_fee(&mut self, fee_rate: u64) {
        self.fee_rate = fee_rate;
        let fee_msat = commitment_fee_msat(self.num_nondust, fee_rate);
        self.recalculate_fees(fee_msat);
    }

    /// Charge an exact fee in satoshis (used for the close transaction).
    /// Returns false when the channel cannot pay it in full; the state is
    /// still altered to pay as much as possible.
    pub fn force_fee(&mut self, fee_sat: u64) -> bool {
        if fee_sat > u64::MAX / 1000 {
            return false;
        }
        self.recalculate_fees(fee_sat * 1000);
        self.side(Side::Ours).fee_msat + self.side(Side::Theirs).fee_msat == fee_sat * 1000
    }

    /// The total value currently held by in-flight HTLCs.
    pub fn htlc_total_msat(&self) -> u64 {
        self.anchor_sat * 1000
            - self.sides.iter().map(|s| s.pay_msat + s.fee_msat).sum::<u64>()
    }

    /// Pay fee from one side if possible, returning the amount left unpaid.
    fn pay_fee(side: &mut BalanceSide, fee_msat: u64) -> u64 {
        if side.pay_msat >= fee_msat {
            side.pay_msat -= fee_msat;
            side.fee_msat += fee_msat;
            0
        } else {
            let remainder = fee_msat - side.pay_msat;
            side.fee_msat += side.pay_msat;
            side.pay_msat = 0;
            remainder
        }
    }

    /// Split the fee between the sides: each pays half from its payable
    /// balance; a side that cannot cover its half drains to zero and the
    /// remainder spills over to the counterparty, which in turn spills to
    /// zero if also insufficient.
    fn recalculate_fees(&mut self, fee_msat: u64) {
        // Fold previous fees back in before splitting again.
        for side in self.sides.iter_mut() {
            side.pay_msat += side.fee_msat;
            side.fee_msat = 0;
        }

        let [a, b] = &mut self.sides;
        let mut remainder = Self::pay_fee(a, fee_msat / 2) + Self::pay_fee(b, fee_msat / 2);
        remainder = Self::pay_fee(a, remainder);
        Self::pay_fee(b, remainder);
    }

    /// Move `htlc_msat` out of `payer` into HTLC escrow (a negative amount
    /// credits the side), then recompute fees for `num_nondust` outputs.
    fn change_funding(&mut self, htlc_msat: i64, payer: Side, num_nondust: u32) -> bool {
        let htlcs_total = self.htlc_total_msat();
        let fee_msat = commitment_fee_msat(num_nondust, self.fee_rate);

        // If the payer side is paying, can it afford the HTLC plus its half
        // of the fee out of what it currently holds?
        if htlc_msat > 0 {
            let a = self.side(payer);
            if htlc_msat as u64 + fee_msat / 2 > a.pay_msat + a.fee_msat {
                return false;
            }
        }

        // Fold fees back first so the payer balance cannot transiently
        // underflow before the split below.
        for side in self.sides.iter_mut() {
            side.pay_msat += side.fee_msat;
            side.fee_msat = 0;
        }
        let a = self.side_mut(payer);
        a.pay_msat = (a.pay_msat as i64 - htlc_msat) as u64;

        self.recalculate_fees(fee_msat);
        self.num_nondust = num_nondust;

        debug_assert_eq!(
            self.htlc_total_msat(),
            (htlcs_total as i64 + htlc_msat) as u64
        );
        true
    }
}
