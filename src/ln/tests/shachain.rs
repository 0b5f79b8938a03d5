use crate::ln::shachain::{
    shachain_from_seed, Shachain, ShachainError, SHACHAIN_BLOB_LEN,
};

const SEED: [u8; 32] = [0x42; 32];

/// The Nth revocation occupies index u64::MAX - N.
fn index_for(n: u64) -> u64 {
    u64::MAX - n
}

#[test]
fn test_add_and_lookup_full_chain() {
    let mut chain = Shachain::new();
    for n in 0..100 {
        let index = index_for(n);
        chain
            .add_hash(index, shachain_from_seed(&SEED, index))
            .expect("insertion in descending index order");

        // Every previously inserted hash stays derivable.
        for m in 0..=n {
            let expect = shachain_from_seed(&SEED, index_for(m));
            assert_eq!(chain.get_hash(index_for(m)), Some(expect), "lookup {}", m);
        }
        // And the tower stays logarithmic.
        assert!(chain.num_valid() <= 64 + 1);
    }
}

#[test]
fn test_add_out_of_order_rejected() {
    let mut chain = Shachain::new();
    // The chain must start at the maximum index.
    assert_eq!(
        chain.add_hash(index_for(1), shachain_from_seed(&SEED, index_for(1))),
        Err(ShachainError::OutOfOrder)
    );

    chain
        .add_hash(index_for(0), shachain_from_seed(&SEED, index_for(0)))
        .expect("start of chain");

    // Same index again (a replayed revocation) is rejected.
    assert_eq!(
        chain.add_hash(index_for(0), shachain_from_seed(&SEED, index_for(0))),
        Err(ShachainError::OutOfOrder)
    );
    // Skipping an index is rejected.
    assert_eq!(
        chain.add_hash(index_for(2), shachain_from_seed(&SEED, index_for(2))),
        Err(ShachainError::OutOfOrder)
    );
}

#[test]
fn test_add_underivable_hash_rejected() {
    let mut chain = Shachain::new();
    chain
        .add_hash(index_for(0), shachain_from_seed(&SEED, index_for(0)))
        .expect("start of chain");

    // index_for(1) has one trailing zero, so it must derive the slot for
    // index_for(0); garbage cannot.
    assert_eq!(
        chain.add_hash(index_for(1), [0u8; 32]),
        Err(ShachainError::Underivable)
    );

    // The real secret is accepted.
    chain
        .add_hash(index_for(1), shachain_from_seed(&SEED, index_for(1)))
        .expect("valid secret");
}

#[test]
fn test_lookup_unknown_index() {
    let mut chain = Shachain::new();
    assert_eq!(chain.get_hash(index_for(0)), None);
    chain
        .add_hash(index_for(0), shachain_from_seed(&SEED, index_for(0)))
        .expect("start of chain");
    // Not yet inserted (smaller index) fails.
    assert_eq!(chain.get_hash(index_for(1)), None);
}

#[test]
fn test_linearize_round_trip() {
    let mut chain = Shachain::new();
    let bytes = chain.to_bytes();
    assert_eq!(bytes.len(), SHACHAIN_BLOB_LEN);
    assert_eq!(Shachain::from_bytes(&bytes), Ok(chain.clone()));

    for n in 0..70 {
        let index = index_for(n);
        chain
            .add_hash(index, shachain_from_seed(&SEED, index))
            .expect("insertion in descending index order");
        let bytes = chain.to_bytes();
        assert_eq!(bytes.len(), SHACHAIN_BLOB_LEN);
        assert_eq!(Shachain::from_bytes(&bytes), Ok(chain.clone()));
    }
}

#[test]
fn test_linearize_layout() {
    let mut chain = Shachain::new();
    let index = index_for(0);
    let hash = shachain_from_seed(&SEED, index);
    chain.add_hash(index, hash).expect("start of chain");

    let bytes = chain.to_bytes();
    // (u64 min_index)(u32 num_valid)(u64 index, 32-byte hash) x 65, all
    // little-endian integers.
    assert_eq!(&bytes[0..8], &index.to_le_bytes());
    assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
    assert_eq!(&bytes[12..20], &index.to_le_bytes());
    assert_eq!(&bytes[20..52], &hash);
    // Unused slots are zero-filled.
    assert!(bytes[52..].iter().all(|&b| b == 0));
}

#[test]
fn test_from_bytes_rejects_malformed() {
    assert_eq!(
        Shachain::from_bytes(&[0u8; 100]),
        Err(ShachainError::BadBlob)
    );
    let mut bytes = Shachain::new().to_bytes();
    // num_valid beyond the tower size.
    bytes[8..12].copy_from_slice(&66u32.to_le_bytes());
    assert_eq!(Shachain::from_bytes(&bytes), Err(ShachainError::BadBlob));
}

#[test]
fn test_seed_derivation_is_deterministic() {
    let a = shachain_from_seed(&SEED, index_for(7));
    let b = shachain_from_seed(&SEED, index_for(7));
    assert_eq!(a, b);
    assert_ne!(a, shachain_from_seed(&SEED, index_for(8)));
    assert_ne!(a, shachain_from_seed(&[0x43; 32], index_for(7)));
}
