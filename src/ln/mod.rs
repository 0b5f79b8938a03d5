pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod cstate;
pub mod fee;
pub mod htlc;
pub mod network;
pub mod serde_utils;
pub mod shachain;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::NodeConfig;

use ractor::{Actor, ActorCell, ActorRef};
use tracing::info;

use crate::store::Store;
use network::{node_key, NetworkActor, NetworkActorMessage};

/// Spawn the network actor under the given supervisor and return its
/// handle. The node identity key is created on first start.
pub async fn start_node(
    config: NodeConfig,
    store: Store,
    supervisor: ActorCell,
) -> ActorRef<NetworkActorMessage> {
    let node_id = node_key(&store).pubkey();
    info!("node id {}", node_id);
    Actor::spawn_linked(
        Some(format!("network actor {}", node_id)),
        NetworkActor::new(store),
        (config, node_id),
        supervisor,
    )
    .await
    .expect("start network actor")
    .0
}
