use core::fmt::{self, Formatter};
use std::fmt::{Debug, Display};

use secp256k1::{ecdsa, Message, Secp256k1};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, IfIsHumanReadable};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::serde_utils::SliceHex;

/// The error type wrapping the various ser/de failures of the wire layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pubkey/signature format
    #[error("Secp error: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("Wire codec error: {0}")]
    Wire(#[from] bincode::Error),
    #[error("Error: {0}")]
    AnyHow(#[from] anyhow::Error),
}

// ============================================================
// Hash256
// ============================================================

/// A 256-bit digest, used as channel peer id material, payment hash,
/// revocation hash and transaction id.
#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Hash256(#[serde_as(as = "IfIsHumanReadable<SliceHex>")] [u8; 32]);

impl From<[u8; 32]> for Hash256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for Hash256 {
    type Error = anyhow::Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 32 {
            return Err(anyhow::anyhow!("Invalid hash length"));
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(&value);
        Ok(Hash256(data))
    }
}

impl From<Hash256> for [u8; 32] {
    fn from(val: Hash256) -> Self {
        val.0
    }
}

impl ::core::fmt::LowerHex for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Hash256({:#x})", self)
    }
}

impl Display for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// SHA-256 helper.
pub fn sha256<T: AsRef<[u8]>>(data: T) -> Hash256 {
    let digest: [u8; 32] = Sha256::digest(data.as_ref()).into();
    Hash256(digest)
}

// ============================================================
// Preimage
// ============================================================

/// A 32-byte secret whose SHA-256 appears in an HTLC or a commitment
/// transaction (payment preimage / revocation preimage).
#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Default)]
pub struct Preimage(#[serde_as(as = "IfIsHumanReadable<SliceHex>")] [u8; 32]);

impl Preimage {
    pub fn hash(&self) -> Hash256 {
        sha256(self.0)
    }
}

impl From<[u8; 32]> for Preimage {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Preimage {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for Preimage {
    type Error = anyhow::Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 32 {
            return Err(anyhow::anyhow!("Invalid preimage length"));
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(&value);
        Ok(Preimage(data))
    }
}

impl From<Preimage> for [u8; 32] {
    fn from(val: Preimage) -> Self {
        val.0
    }
}

impl Debug for Preimage {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        // Secrets are not logged in full.
        write!(f, "Preimage(0x{}..)", hex::encode(&self.0[..4]))
    }
}

// ============================================================
// Keys and signatures
// ============================================================

/// A public key used to identify peers and verify commitment signatures.
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Pubkey(pub secp256k1::PublicKey);

impl Pubkey {
    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        Ok(Pubkey(secp256k1::PublicKey::from_slice(data)?))
    }
}

impl From<secp256k1::PublicKey> for Pubkey {
    fn from(pk: secp256k1::PublicKey) -> Self {
        Pubkey(pk)
    }
}

impl Debug for Pubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", hex::encode(self.serialize()))
    }
}

impl Display for Pubkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.serialize()))
    }
}

/// A secret key. Signs commitment and closing transactions.
#[derive(Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Privkey(pub secp256k1::SecretKey);

impl Privkey {
    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        Ok(Privkey(secp256k1::SecretKey::from_slice(data)?))
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey(self.0.public_key(&Secp256k1::new()))
    }

    /// Sign a 32-byte digest.
    pub fn sign(&self, digest: Hash256) -> EcdsaSignature {
        let message = Message::from_digest(digest.into());
        EcdsaSignature(Secp256k1::new().sign_ecdsa(&message, &self.0))
    }

    pub fn serialize(&self) -> [u8; 32] {
        self.0.secret_bytes()
    }
}

impl Debug for Privkey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Privkey(..)")
    }
}

/// An ECDSA signature over a commitment or closing transaction digest.
#[derive(Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EcdsaSignature(pub ecdsa::Signature);

impl EcdsaSignature {
    pub fn serialize_compact(&self) -> [u8; 64] {
        self.0.serialize_compact()
    }

    pub fn from_compact(data: &[u8]) -> Result<Self, Error> {
        Ok(EcdsaSignature(ecdsa::Signature::from_compact(data)?))
    }

    pub fn verify(&self, digest: Hash256, key: &Pubkey) -> bool {
        let message = Message::from_digest(digest.into());
        Secp256k1::new()
            .verify_ecdsa(&message, &self.0, &key.0)
            .is_ok()
    }
}

impl Debug for EcdsaSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "EcdsaSignature({})", hex::encode(self.serialize_compact()))
    }
}

// ============================================================
// Wire packets
// ============================================================

/// Which side will create and broadcast the anchor transaction.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnchorOffer {
    WillCreateAnchor,
    WontCreateAnchor,
}

/// A locktime carried on the wire, either in blocks or in seconds.
/// The seconds variant is rejected by every acceptor that sees one.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Locktime {
    Blocks(u32),
    Seconds(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Open {
    pub revocation_hash: Hash256,
    pub next_revocation_hash: Hash256,
    pub commit_key: Pubkey,
    pub final_key: Pubkey,
    pub delay: Locktime,
    pub initial_fee_rate: u64,
    pub anchor_offer: AnchorOffer,
    pub min_depth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenAnchor {
    pub txid: Hash256,
    pub output_index: u32,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenCommitSig {
    pub sig: EcdsaSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenComplete {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateAddHtlc {
    pub id: u64,
    pub amount_msat: u64,
    pub rhash: Hash256,
    pub expiry: Locktime,
    pub route: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateFulfillHtlc {
    pub id: u64,
    pub r: Preimage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateFailHtlc {
    pub id: u64,
    /// Opaque failure reason, carried verbatim.
    pub reason: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateCommit {
    pub sig: Option<EcdsaSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRevocation {
    pub revocation_preimage: Preimage,
    pub next_revocation_hash: Hash256,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateFee {
    pub fee_rate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseShutdown {
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseSignature {
    pub close_fee: u64,
    pub sig: EcdsaSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPacket {
    pub problem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconnect {
    /// Count of order-stamped packets this side has received from the peer.
    pub ack: u64,
}

/// First packet on a fresh transport, identifying the sending node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Init {
    pub node_id: Pubkey,
}

/// The logical packet envelope exchanged between two peers. The byte
/// representation is an opaque bijection produced by the wire codec below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerMessage {
    Init(Init),
    Open(Open),
    OpenAnchor(OpenAnchor),
    OpenCommitSig(OpenCommitSig),
    OpenComplete(OpenComplete),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    UpdateCommit(UpdateCommit),
    UpdateRevocation(UpdateRevocation),
    UpdateFee(UpdateFee),
    CloseShutdown(CloseShutdown),
    CloseSignature(CloseSignature),
    Error(ErrorPacket),
    Reconnect(Reconnect),
}

impl PeerMessage {
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("serialize peer message")
    }

    pub fn from_wire_slice(data: &[u8]) -> Result<Self, Error> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Init(_) => "INIT",
            PeerMessage::Open(_) => "OPEN",
            PeerMessage::OpenAnchor(_) => "OPEN_ANCHOR",
            PeerMessage::OpenCommitSig(_) => "OPEN_COMMIT_SIG",
            PeerMessage::OpenComplete(_) => "OPEN_COMPLETE",
            PeerMessage::UpdateAddHtlc(_) => "UPDATE_ADD_HTLC",
            PeerMessage::UpdateFulfillHtlc(_) => "UPDATE_FULFILL_HTLC",
            PeerMessage::UpdateFailHtlc(_) => "UPDATE_FAIL_HTLC",
            PeerMessage::UpdateCommit(_) => "UPDATE_COMMIT",
            PeerMessage::UpdateRevocation(_) => "UPDATE_REVOCATION",
            PeerMessage::UpdateFee(_) => "UPDATE_FEE",
            PeerMessage::CloseShutdown(_) => "CLOSE_SHUTDOWN",
            PeerMessage::CloseSignature(_) => "CLOSE_SIGNATURE",
            PeerMessage::Error(_) => "ERROR",
            PeerMessage::Reconnect(_) => "RECONNECT",
        }
    }
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
