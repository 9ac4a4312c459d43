//! Authenticated, group-filtered pub/sub over a p2p mesh.
//!
//! Wire frames are self-describing tagged payloads carrying the sender's
//! operator public key and a signature over the payload. A per-channel
//! registry maps message-type tags to decode functions; frames with an
//! unknown tag, a bad signature, or a sender outside the membership filter
//! are dropped silently.

mod local;

pub use local::{LocalNetwork, LocalNetworkHub};

use crate::foundation::Result;
use async_trait::async_trait;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// A protocol message that can travel on a broadcast channel.
pub trait ProtocolMessage: Send + Sync + Any {
    /// Tag identifying the message type on the wire.
    fn message_type(&self) -> &'static str;
    fn marshal(&self) -> Result<Vec<u8>>;
    fn as_any(&self) -> &dyn Any;
}

/// Decode function registered for one message-type tag.
pub type UnmarshalFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn ProtocolMessage>> + Send + Sync>;

/// Predicate narrowing deliveries to senders whose operator public key
/// satisfies it.
pub type BroadcastChannelFilter = Box<dyn Fn(&PublicKey) -> bool + Send + Sync>;

/// A message that passed signature verification and the membership filter.
#[derive(Clone)]
pub struct ReceivedMessage {
    pub sender_public_key: PublicKey,
    pub payload: Arc<dyn ProtocolMessage>,
}

impl ReceivedMessage {
    pub fn payload_as<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }
}

/// Handler invoked for every received message of the registered type.
/// Handlers fire concurrently; the channel does not serialize them.
pub struct MessageHandler {
    pub message_type: &'static str,
    pub handler: Arc<dyn Fn(ReceivedMessage) + Send + Sync>,
}

/// Named best-effort broadcast channel.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Best-effort broadcast to all peers on the channel.
    async fn send(&self, message: &dyn ProtocolMessage) -> Result<()>;

    /// Registers a handler fired for messages of its type.
    fn recv(&self, handler: MessageHandler);

    /// Removes all handlers of the given type.
    fn unregister_recv(&self, message_type: &str);

    /// Installs the membership filter. Replaces any previous filter.
    fn set_filter(&self, filter: BroadcastChannelFilter);

    /// Registers the decode function for a message-type tag. Frames with an
    /// unregistered tag are dropped.
    fn register_unmarshaler(&self, message_type: &'static str, unmarshal: UnmarshalFn);
}

/// Provider of broadcast channels, one per name.
pub trait NetworkProvider: Send + Sync {
    fn broadcast_channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>>;
}

/// Frame as it travels between peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportEnvelope {
    pub channel: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    /// Compressed secp256k1 public key of the sending operator.
    pub sender_public_key: Vec<u8>,
    /// ECDSA signature over the envelope digest.
    pub signature: Vec<u8>,
}

/// Digest the sender signs: channel name, type tag, and payload, length
/// prefixed so fields cannot bleed into each other.
pub fn envelope_digest(channel: &str, message_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut preimage = Vec::with_capacity(channel.len() + message_type.len() + payload.len() + 24);
    preimage.extend_from_slice(&(channel.len() as u64).to_le_bytes());
    preimage.extend_from_slice(channel.as_bytes());
    preimage.extend_from_slice(&(message_type.len() as u64).to_le_bytes());
    preimage.extend_from_slice(message_type.as_bytes());
    preimage.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    preimage.extend_from_slice(payload);
    preimage
}
