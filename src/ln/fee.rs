/// Outputs below this satoshi value are not worth including on-chain. The
/// predicate is fixed by the on-chain collaborator; balance accounting still
/// moves the full HTLC value.
pub const DUST_LIMIT_SATOSHIS: u64 = 546;

/// Base byte-count of a commitment transaction with no HTLC outputs.
pub const COMMITMENT_TX_BASE_BYTES: u64 = 338;

/// Additional byte-count per non-dust HTLC output.
pub const COMMITMENT_TX_HTLC_BYTES: u64 = 32;

pub fn is_dust(satoshis: u64) -> bool {
    satoshis < DUST_LIMIT_SATOSHIS
}

/// The fee for a transaction is the bytecount multiplied by the fee rate
/// (satoshis per 1000 bytes), divided by 1000 and truncated to an even
/// number of satoshis.
pub fn fee_by_rate(txsize: u64, fee_rate: u64) -> u64 {
    txsize * fee_rate / 2000 * 2
}

/// Commitment transaction fee in milli-satoshi. The bytecount is
/// 338 + 32 bytes for every non-dust HTLC; the fee requirement is unchanged
/// even when the elimination of dust outputs already left a non-zero fee.
pub fn commitment_fee_msat(num_nondust: u32, fee_rate: u64) -> u64 {
    let bytes = COMMITMENT_TX_BASE_BYTES + COMMITMENT_TX_HTLC_BYTES * num_nondust as u64;
    fee_by_rate(bytes, fee_rate) * 1000
}
