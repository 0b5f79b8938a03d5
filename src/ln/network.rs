use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::store::{SecretsRow, Store};
use crate::tasks;

use super::bootstrap;
use super::channel::{
    AnchorFunding, ChannelActor, ChannelActorMessage, ChannelCommand, ChannelEvent,
    ChannelInitializationParams, ChannelActorState, OpenChannelParams, RelayAction,
};
use super::config::NodeConfig;
use super::htlc::HtlcSide;
use super::types::{Init, PeerMessage, Privkey, Pubkey};

/// Frames larger than this are garbage, not packets.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug)]
pub struct PeerMessageWithId {
    pub peer_id: Pubkey,
    pub message: PeerMessage,
}

#[derive(Debug)]
pub enum NetworkActorMessage {
    Command(NetworkActorCommand),
    Event(NetworkActorEvent),
}

impl NetworkActorMessage {
    pub fn new_command(command: NetworkActorCommand) -> Self {
        NetworkActorMessage::Command(command)
    }

    pub fn new_event(event: NetworkActorEvent) -> Self {
        NetworkActorMessage::Event(event)
    }
}

#[derive(Debug)]
pub enum NetworkActorCommand {
    /// Dial a peer without opening anything; useful to let a restored
    /// channel reestablish.
    ConnectPeer { host: String, port: u16 },
    /// Dial a peer and open a channel once identified, funding it with the
    /// given anchor outpoint.
    OpenChannel(OpenChannelCommand),
    /// Transmit one packet to a connected peer.
    SendPeerMessage(PeerMessageWithId),
    /// Hand a command to the peer's channel actor.
    ChannelCommand {
        peer_id: Pubkey,
        command: ChannelCommand,
    },
    /// Settle an upstream HTLC after the downstream one resolved.
    Relay(RelayAction),
    /// The channel actor finished tearing the channel down.
    ChannelClosed(Pubkey),
    /// Confirmation depth report from the chain watcher.
    AnchorConfirmed { peer_id: Pubkey, depth: u32 },
}

#[derive(Debug)]
pub struct OpenChannelCommand {
    pub host: String,
    pub port: u16,
    pub funding: AnchorFunding,
}

#[derive(Debug)]
pub enum NetworkActorEvent {
    PeerConnected {
        peer_id: Pubkey,
        addr: SocketAddr,
        writer: mpsc::UnboundedSender<PeerMessage>,
        /// Set when this connection was dialed to open a channel.
        opening: Option<AnchorFunding>,
    },
    PeerDisconnected {
        peer_id: Pubkey,
    },
    PeerMessage {
        peer_id: Pubkey,
        message: PeerMessage,
    },
    ConnectFailed {
        host: String,
        port: u16,
    },
}

struct PeerSession {
    addr: SocketAddr,
    writer: mpsc::UnboundedSender<PeerMessage>,
}

pub struct NetworkActorState {
    node_id: Pubkey,
    config: NodeConfig,
    peers: HashMap<Pubkey, PeerSession>,
    channels: HashMap<Pubkey, ActorRef<ChannelActorMessage>>,
}

pub struct NetworkActor {
    store: Store,
}

impl NetworkActor {
    pub fn new(store: Store) -> Self {
        NetworkActor { store }
    }

    async fn spawn_channel_actor(
        &self,
        myself: &ActorRef<NetworkActorMessage>,
        state: &mut NetworkActorState,
        peer_id: Pubkey,
        args: ChannelInitializationParams,
    ) -> Result<(), ActorProcessingErr> {
        let actor = ChannelActor::new(
            self.store.clone(),
            myself.clone(),
            state.config.clone(),
        );
        match Actor::spawn_linked(
            Some(format!("channel {}", peer_id)),
            actor,
            args,
            myself.get_cell(),
        )
        .await
        {
            Ok((channel, _)) => {
                state.channels.insert(peer_id, channel);
            }
            Err(err) => error!("failed to start channel with {}: {}", peer_id, err),
        }
        Ok(())
    }

    fn open_params(&self, config: &NodeConfig, funding: Option<AnchorFunding>) -> OpenChannelParams {
        OpenChannelParams {
            commit_fee_rate: config.commitment_fee_rate(),
            locktime_blocks: config.locktime_blocks(),
            min_depth: config.anchor_confirms_min(),
            secrets: generate_secrets(),
            funding,
        }
    }

    fn dial(&self, myself: &ActorRef<NetworkActorMessage>, host: String, port: u16, opening: Option<AnchorFunding>) {
        let network = myself.clone();
        let fail_network = myself.clone();
        let fail_host = host.clone();
        let node_id_store = self.store.clone();
        bootstrap::resolve_and_connect(
            host,
            port,
            move |stream, addr| {
                let node_id = node_key(&node_id_store).pubkey();
                tasks::spawn(run_session(stream, addr, network, node_id, opening));
            },
            move || {
                let _ = fail_network.send_message(NetworkActorMessage::new_event(
                    NetworkActorEvent::ConnectFailed {
                        host: fail_host,
                        port,
                    },
                ));
            },
        );
    }

    /// Load every non-closed peer from the store, verify the HTLC source
    /// links across them, and spawn their channel actors.
    async fn restore_peers(
        &self,
        myself: &ActorRef<NetworkActorMessage>,
        state: &mut NetworkActorState,
    ) -> Result<(), ActorProcessingErr> {
        let mut restored: Vec<ChannelActorState> = Vec::new();
        for peer_id in self.store.peer_ids() {
            match ChannelActorState::restore(&self.store, &state.config, state.node_id, peer_id) {
                Ok(channel) if !channel.state.is_closed() => restored.push(channel),
                Ok(_) => debug!("peer {} is closed, not restoring", peer_id),
                Err(err) => error!("failed restoring peer {}: {}", peer_id, err),
            }
        }

        // Every HTLC source must name an HTLC the source peer offered us,
        // unless the HTLC is already resolved on both sides.
        let offered: HashMap<Pubkey, HashSet<u64>> = restored
            .iter()
            .map(|channel| {
                let ids = channel
                    .htlcs
                    .iter()
                    .filter(|htlc| htlc.owner == HtlcSide::Remote)
                    .map(|htlc| htlc.id)
                    .collect();
                (channel.peer_id, ids)
            })
            .collect();
        for channel in &restored {
            for htlc in channel.htlcs.iter() {
                let Some((src_peer, src_id)) = htlc.src else {
                    continue;
                };
                if htlc.state.is_resolved() {
                    continue;
                }
                assert!(
                    offered
                        .get(&src_peer)
                        .is_some_and(|ids| ids.contains(&src_id)),
                    "connect_htlc_src: unknown src htlc {}/{}",
                    src_peer,
                    src_id,
                );
            }
        }

        for channel in restored {
            let peer_id = channel.peer_id;
            let addr = channel.addr;
            info!("restored channel with {} in {:?}", peer_id, channel.state);
            self.spawn_channel_actor(
                myself,
                state,
                peer_id,
                ChannelInitializationParams::Restored(Box::new(channel)),
            )
            .await?;
            // Try to reach the peer again so the channel can reestablish.
            self.dial(myself, addr.ip().to_string(), addr.port(), None);
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        myself: &ActorRef<NetworkActorMessage>,
        state: &mut NetworkActorState,
        command: NetworkActorCommand,
    ) -> Result<(), ActorProcessingErr> {
        match command {
            NetworkActorCommand::ConnectPeer { host, port } => {
                self.dial(myself, host, port, None);
            }
            NetworkActorCommand::OpenChannel(open) => {
                self.dial(myself, open.host, open.port, Some(open.funding));
            }
            NetworkActorCommand::SendPeerMessage(PeerMessageWithId { peer_id, message }) => {
                match state.peers.get(&peer_id) {
                    Some(session) => {
                        if session.writer.send(message).is_err() {
                            warn!("transport to {} is gone", peer_id);
                        }
                    }
                    None => warn!("no session for {}, dropping {}", peer_id, message),
                }
            }
            NetworkActorCommand::ChannelCommand { peer_id, command } => {
                match state.channels.get(&peer_id) {
                    Some(channel) => {
                        channel.send_message(ChannelActorMessage::Command(command))?;
                    }
                    None => warn!("no channel with {}", peer_id),
                }
            }
            NetworkActorCommand::Relay(action) => {
                let (peer_id, command) = match action {
                    RelayAction::FulfillUpstream { peer, id, r } => {
                        (peer, ChannelCommand::FulfillHtlc { id, r })
                    }
                    RelayAction::FailUpstream { peer, id, reason } => {
                        (peer, ChannelCommand::FailHtlc { id, reason })
                    }
                };
                match state.channels.get(&peer_id) {
                    Some(channel) => {
                        channel.send_message(ChannelActorMessage::Command(command))?;
                    }
                    None => warn!("upstream channel {} is gone", peer_id),
                }
            }
            NetworkActorCommand::ChannelClosed(peer_id) => {
                state.channels.remove(&peer_id);
                state.peers.remove(&peer_id);
                info!("channel with {} closed and forgotten", peer_id);
            }
            NetworkActorCommand::AnchorConfirmed { peer_id, depth } => {
                if let Some(channel) = state.channels.get(&peer_id) {
                    channel.send_message(ChannelActorMessage::Event(
                        ChannelEvent::AnchorConfirmed(depth),
                    ))?;
                }
            }
        }
        Ok(())
    }

    async fn handle_event(
        &self,
        myself: &ActorRef<NetworkActorMessage>,
        state: &mut NetworkActorState,
        event: NetworkActorEvent,
    ) -> Result<(), ActorProcessingErr> {
        match event {
            NetworkActorEvent::PeerConnected {
                peer_id,
                addr,
                writer,
                opening,
            } => {
                info!("peer {} connected from {}", peer_id, addr);
                state.peers.insert(peer_id, PeerSession { addr, writer });
                if let Some(channel) = state.channels.get(&peer_id) {
                    channel
                        .send_message(ChannelActorMessage::Event(ChannelEvent::PeerConnected))?;
                } else if let Some(funding) = opening {
                    let params = self.open_params(&state.config, Some(funding));
                    self.spawn_channel_actor(
                        myself,
                        state,
                        peer_id,
                        ChannelInitializationParams::OpenChannel {
                            peer_id,
                            local_node_id: state.node_id,
                            addr,
                            params,
                        },
                    )
                    .await?;
                }
            }
            NetworkActorEvent::PeerDisconnected { peer_id } => {
                debug!("peer {} disconnected", peer_id);
                state.peers.remove(&peer_id);
                if let Some(channel) = state.channels.get(&peer_id) {
                    channel
                        .send_message(ChannelActorMessage::Event(ChannelEvent::PeerDisconnected))?;
                }
            }
            NetworkActorEvent::PeerMessage { peer_id, message } => {
                if let Some(channel) = state.channels.get(&peer_id) {
                    channel.send_message(ChannelActorMessage::PeerMessage(message))?;
                } else if let PeerMessage::Open(open) = message {
                    let addr = match state.peers.get(&peer_id) {
                        Some(session) => session.addr,
                        None => {
                            warn!("OPEN from unknown session {}", peer_id);
                            return Ok(());
                        }
                    };
                    let params = self.open_params(&state.config, None);
                    self.spawn_channel_actor(
                        myself,
                        state,
                        peer_id,
                        ChannelInitializationParams::AcceptChannel {
                            peer_id,
                            local_node_id: state.node_id,
                            addr,
                            params,
                            open,
                        },
                    )
                    .await?;
                } else {
                    debug!("dropping {} from {}: no channel", message, peer_id);
                }
            }
            NetworkActorEvent::ConnectFailed { host, port } => {
                warn!("could not reach {}:{}", host, port);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Actor for NetworkActor {
    type Msg = NetworkActorMessage;
    type State = NetworkActorState;
    type Arguments = (NodeConfig, Pubkey);

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        (config, node_id): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        if let Some(port) = config.listen_port() {
            let listener = TcpListener::bind((config.listen_addr(), port)).await?;
            info!("listening on {}", listener.local_addr()?);
            let network = myself.clone();
            let store = self.store.clone();
            tasks::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            let node_id = node_key(&store).pubkey();
                            tasks::spawn(run_session(
                                stream,
                                addr,
                                network.clone(),
                                node_id,
                                None,
                            ));
                        }
                        Err(err) => {
                            error!("accept failed: {}", err);
                            break;
                        }
                    }
                }
            });
        }

        let mut state = NetworkActorState {
            node_id,
            config,
            peers: HashMap::new(),
            channels: HashMap::new(),
        };
        self.restore_peers(&myself, &mut state).await?;
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            NetworkActorMessage::Command(command) => {
                self.handle_command(&myself, state, command).await?
            }
            NetworkActorMessage::Event(event) => self.handle_event(&myself, state, event).await?,
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let SupervisionEvent::ActorTerminated(who, _, _) = message {
            state
                .channels
                .retain(|_, channel| channel.get_cell().get_id() != who.get_id());
        }
        Ok(())
    }
}

// ============================================================
// Transport sessions
// ============================================================

async fn write_frame(writer: &mut OwnedWriteHalf, message: &PeerMessage) -> std::io::Result<()> {
    let bytes = message.to_wire_bytes();
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<PeerMessage> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized frame",
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    PeerMessage::from_wire_slice(&buf)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
}

/// One connected transport: exchange Init, then pump packets between the
/// socket and the network actor until either side goes away.
async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    network: ActorRef<NetworkActorMessage>,
    node_id: Pubkey,
    opening: Option<AnchorFunding>,
) {
    let (mut reader, mut writer) = stream.into_split();

    if let Err(err) = write_frame(&mut writer, &PeerMessage::Init(Init { node_id })).await {
        warn!("session {}: failed to send INIT: {}", addr, err);
        return;
    }
    let peer_id = match read_frame(&mut reader).await {
        Ok(PeerMessage::Init(init)) => init.node_id,
        Ok(other) => {
            warn!("session {}: expected INIT, got {}", addr, other);
            return;
        }
        Err(err) => {
            warn!("session {}: handshake failed: {}", addr, err);
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<PeerMessage>();
    if network
        .send_message(NetworkActorMessage::new_event(
            NetworkActorEvent::PeerConnected {
                peer_id,
                addr,
                writer: tx,
                opening,
            },
        ))
        .is_err()
    {
        return;
    }

    tasks::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &message).await {
                debug!("session write failed: {}", err);
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(message) => {
                if network
                    .send_message(NetworkActorMessage::new_event(
                        NetworkActorEvent::PeerMessage { peer_id, message },
                    ))
                    .is_err()
                {
                    return;
                }
            }
            Err(err) => {
                debug!("session {} read ended: {}", addr, err);
                break;
            }
        }
    }
    let _ = network.send_message(NetworkActorMessage::new_event(
        NetworkActorEvent::PeerDisconnected { peer_id },
    ));
}

// ============================================================
// Node identity
// ============================================================

/// Long-term secrets for a fresh channel.
pub fn generate_secrets() -> SecretsRow {
    let mut rng = rand::thread_rng();
    let mut seed = [0u8; 32];
    rand::Rng::fill(&mut rng, &mut seed[..]);
    SecretsRow {
        commitkey: Privkey(secp256k1::SecretKey::new(&mut rng)),
        finalkey: Privkey(secp256k1::SecretKey::new(&mut rng)),
        revocation_seed: seed,
    }
}

/// The node's wallet key, created on first use.
pub fn node_key(store: &Store) -> Privkey {
    if let Some(privkey) = store.wallet_privkeys().into_iter().next() {
        return privkey;
    }
    let privkey = Privkey(secp256k1::SecretKey::new(&mut rand::thread_rng()));
    let mut txn = store.begin_transaction();
    txn.add_wallet_privkey(&privkey);
    txn.commit().expect("persist wallet key");
    privkey
}
