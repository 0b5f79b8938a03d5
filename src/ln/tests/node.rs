use std::time::{Duration, Instant};

use ractor::{Actor, ActorRef};
use tempfile::TempDir;

use crate::actors::RootActor;
use crate::ln::channel::{ChannelCommand, ChannelState};
use crate::ln::htlc::{HtlcSide, HtlcState};
use crate::ln::network::{node_key, NetworkActorCommand, NetworkActorMessage, OpenChannelCommand};
use crate::ln::NodeConfig;
use crate::store::Store;
use crate::tasks::{new_tokio_cancellation_token, new_tokio_task_tracker};
use crate::ln::types::Pubkey;

use super::utils::{add_htlc_command, anchor_funding, preimage};

struct TestNode {
    network: ActorRef<NetworkActorMessage>,
    store: Store,
    node_id: Pubkey,
    _dir: TempDir,
}

async fn start_test_node(listen_port: u16) -> TestNode {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::new(dir.path().join("db")).expect("open store");
    let mut config = NodeConfig::default();
    config.listen_port = Some(listen_port);
    config.anchor_confirms_min = Some(1);

    let (root, _) = Actor::spawn(
        None,
        RootActor {},
        (new_tokio_task_tracker(), new_tokio_cancellation_token()),
    )
    .await
    .expect("start root actor");

    let network = crate::ln::start_node(config, store.clone(), root.get_cell()).await;
    let node_id = node_key(&store).pubkey();
    TestNode {
        network,
        store,
        node_id,
        _dir: dir,
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn channel_state(store: &Store, peer: &Pubkey) -> Option<ChannelState> {
    store.get_peer(peer).map(|row| row.state)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nodes_open_channel_and_settle_payment() {
    let node_b = start_test_node(45811).await;
    let node_a = start_test_node(0).await;
    let (id_a, id_b) = (node_a.node_id, node_b.node_id);

    node_a
        .network
        .send_message(NetworkActorMessage::new_command(
            NetworkActorCommand::OpenChannel(OpenChannelCommand {
                host: "127.0.0.1".to_string(),
                port: 45811,
                funding: anchor_funding(),
            }),
        ))
        .expect("send open command");

    // The OPEN exchange creates the peer rows on both ends.
    wait_until("channels created", || {
        channel_state(&node_a.store, &id_b).is_some_and(|s| s.is_anchor_ready())
            && channel_state(&node_b.store, &id_a).is_some()
    })
    .await;

    // Feed anchor confirmations until both sides declare the channel
    // usable (the watcher would keep notifying too).
    wait_until("channels ready", || {
        let _ = node_a
            .network
            .send_message(NetworkActorMessage::new_command(
                NetworkActorCommand::AnchorConfirmed {
                    peer_id: id_b,
                    depth: 6,
                },
            ));
        let _ = node_b
            .network
            .send_message(NetworkActorMessage::new_command(
                NetworkActorCommand::AnchorConfirmed {
                    peer_id: id_a,
                    depth: 6,
                },
            ));
        channel_state(&node_a.store, &id_b) == Some(ChannelState::ChannelReady)
            && channel_state(&node_b.store, &id_a) == Some(ChannelState::ChannelReady)
    })
    .await;

    // a offers an HTLC; it must reach "committed on both sides" at b.
    let r = preimage(0x5a);
    node_a
        .network
        .send_message(NetworkActorMessage::new_command(
            NetworkActorCommand::ChannelCommand {
                peer_id: id_b,
                command: ChannelCommand::AddHtlc(add_htlc_command(50_000_000, r.hash())),
            },
        ))
        .expect("send add command");

    wait_until("htlc committed at b", || {
        node_b
            .store
            .get_htlc(&id_a, HtlcSide::Remote, 0)
            .is_some_and(|row| row.state == HtlcState::RcvdAddAckRevocation)
    })
    .await;

    // b reveals the preimage; the removal settles on both sides.
    node_b
        .network
        .send_message(NetworkActorMessage::new_command(
            NetworkActorCommand::ChannelCommand {
                peer_id: id_a,
                command: ChannelCommand::FulfillHtlc { id: 0, r },
            },
        ))
        .expect("send fulfill command");

    wait_until("htlc resolved at a", || {
        node_a
            .store
            .get_htlc(&id_b, HtlcSide::Local, 0)
            .is_some_and(|row| {
                row.state == HtlcState::RcvdRemoveAckRevocation && row.r == Some(r)
            })
    })
    .await;
    wait_until("htlc resolved at b", || {
        node_b
            .store
            .get_htlc(&id_a, HtlcSide::Remote, 0)
            .is_some_and(|row| row.state == HtlcState::SentRemoveAckRevocation)
    })
    .await;
}
