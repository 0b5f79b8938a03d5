use tempfile::TempDir;

use crate::ln::htlc::{HtlcSide, HtlcState};
use crate::store::{HtlcRow, Store};

use super::utils::{preimage, privkey};

fn open_store() -> (Store, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::new(dir.path().join("db")).expect("open store");
    (store, dir)
}

fn htlc_row(state: HtlcState) -> HtlcRow {
    HtlcRow {
        state,
        msat: 1_000_000,
        expiry_blocks: 500,
        rhash: preimage(9).hash(),
        r: None,
        routing: b"route".to_vec(),
        src: None,
    }
}

#[test]
fn test_transaction_commit_and_abort() {
    let (store, _dir) = open_store();
    let peer = privkey(1).pubkey();

    let mut txn = store.begin_transaction();
    txn.new_htlc(&peer, HtlcSide::Local, 0, &htlc_row(HtlcState::SentAddHtlc));
    txn.commit().expect("commit");
    assert!(store.get_htlc(&peer, HtlcSide::Local, 0).is_some());

    // Aborted writes leave no trace.
    let mut txn = store.begin_transaction();
    txn.new_htlc(&peer, HtlcSide::Local, 1, &htlc_row(HtlcState::SentAddHtlc));
    txn.abort();
    assert!(store.get_htlc(&peer, HtlcSide::Local, 1).is_none());
}

#[test]
fn test_transaction_reads_its_own_writes() {
    let (store, _dir) = open_store();
    let peer = privkey(1).pubkey();

    let mut txn = store.begin_transaction();
    txn.new_htlc(&peer, HtlcSide::Local, 0, &htlc_row(HtlcState::SentAddHtlc));
    // The guarded update must see the uncommitted insert.
    txn.update_htlc_state(
        &peer,
        HtlcSide::Local,
        0,
        HtlcState::SentAddHtlc,
        HtlcState::SentAddCommit,
    )
    .expect("guard sees overlay");
    txn.commit().expect("commit");

    assert_eq!(
        store
            .get_htlc(&peer, HtlcSide::Local, 0)
            .expect("row exists")
            .state,
        HtlcState::SentAddCommit
    );
}

#[test]
fn test_guarded_update_fails_on_wrong_state() {
    let (store, _dir) = open_store();
    let peer = privkey(1).pubkey();

    let mut txn = store.begin_transaction();
    txn.new_htlc(&peer, HtlcSide::Local, 0, &htlc_row(HtlcState::SentAddHtlc));
    txn.commit().expect("commit");

    let mut txn = store.begin_transaction();
    // Wrong old state: the zero-row effect must surface as an error.
    let err = txn
        .update_htlc_state(
            &peer,
            HtlcSide::Local,
            0,
            HtlcState::SentAddCommit,
            HtlcState::RcvdAddRevocation,
        )
        .expect_err("guard refuses");
    assert!(err.contains("is"));
    // Missing row too.
    txn.update_htlc_state(
        &peer,
        HtlcSide::Local,
        7,
        HtlcState::SentAddHtlc,
        HtlcState::SentAddCommit,
    )
    .expect_err("no such row");
    txn.abort();
}

#[test]
fn test_htlcs_load_in_id_order() {
    let (store, _dir) = open_store();
    let peer = privkey(1).pubkey();

    let mut txn = store.begin_transaction();
    txn.new_htlc(&peer, HtlcSide::Remote, 5, &htlc_row(HtlcState::RcvdAddHtlc));
    txn.new_htlc(&peer, HtlcSide::Local, 2, &htlc_row(HtlcState::SentAddHtlc));
    txn.new_htlc(&peer, HtlcSide::Local, 9, &htlc_row(HtlcState::SentAddHtlc));
    txn.new_htlc(&peer, HtlcSide::Remote, 0, &htlc_row(HtlcState::RcvdAddHtlc));
    txn.commit().expect("commit");

    let ids: Vec<u64> = store.get_htlcs(&peer).into_iter().map(|(_, id, _)| id).collect();
    assert_eq!(ids, vec![0, 2, 5, 9]);
}

#[test]
fn test_forget_peer_removes_every_row() {
    let (store, _dir) = open_store();
    let peer = privkey(1).pubkey();
    let other = privkey(2).pubkey();

    let mut txn = store.begin_transaction();
    txn.new_htlc(&peer, HtlcSide::Local, 0, &htlc_row(HtlcState::SentAddHtlc));
    txn.new_htlc(&other, HtlcSide::Local, 0, &htlc_row(HtlcState::SentAddHtlc));
    txn.save_closing(&peer, &Default::default());
    txn.commit().expect("commit");

    let mut txn = store.begin_transaction();
    txn.forget_peer(&peer);
    txn.commit().expect("commit");

    assert!(store.get_htlc(&peer, HtlcSide::Local, 0).is_none());
    assert!(store.get_closing(&peer).is_none());
    // Other peers' rows are untouched.
    assert!(store.get_htlc(&other, HtlcSide::Local, 0).is_some());
}

#[test]
fn test_wallet_round_trip() {
    let (store, _dir) = open_store();
    let key = privkey(0x55);

    let mut txn = store.begin_transaction();
    txn.add_wallet_privkey(&key);
    txn.commit().expect("commit");

    assert_eq!(store.wallet_privkeys(), vec![key]);
}
