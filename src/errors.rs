use ractor::{MessagingErr, SpawnErr};
use thiserror::Error;

use crate::ln::{
    channel::{ChannelActorMessage, ProcessingChannelError},
    network::NetworkActorMessage,
    types::Pubkey,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Peer not found error: {0:?}")]
    PeerNotFound(Pubkey),
    #[error("Failed to spawn actor: {0}")]
    SpawnErr(#[from] SpawnErr),
    #[error("Failed to send channel actor message: {0}")]
    ChannelMessagingErr(#[from] MessagingErr<ChannelActorMessage>),
    #[error("Failed to send network actor message: {0}")]
    NetworkMessagingErr(#[from] MessagingErr<NetworkActorMessage>),
    #[error("Failed to processing channel: {0}")]
    ChannelError(#[from] ProcessingChannelError),
    #[error("InvalidParameter: {0}")]
    InvalidParameter(String),
    #[error("Database error: {0}")]
    DBInternalError(String),
    #[error("Secret key error: {0}")]
    SecretKeyError(String),
    #[error("Internal error: {0}")]
    InternalError(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
