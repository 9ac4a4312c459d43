//! In-process mesh: every peer's channel of the same name is wired to one
//! shared hub topic. Mirrors the delivery contract of the production
//! overlay, including signature verification, membership filtering, and the
//! tagged unmarshaler registry.

use crate::foundation::Result;
use crate::infrastructure::chain::{verify_signature, OperatorSigner, Signing};
use crate::infrastructure::network::{
    envelope_digest, BroadcastChannel, BroadcastChannelFilter, MessageHandler, NetworkProvider, ProtocolMessage,
    ReceivedMessage, TransportEnvelope, UnmarshalFn,
};
use async_trait::async_trait;
use log::{debug, trace};
use secp256k1::PublicKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANNEL_HUB_CAPACITY: usize = 512;

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared topic space connecting all local peers.
pub struct LocalNetworkHub {
    topics: Mutex<HashMap<String, broadcast::Sender<TransportEnvelope>>>,
}

impl LocalNetworkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { topics: Mutex::new(HashMap::new()) })
    }

    fn topic(&self, name: &str) -> broadcast::Sender<TransportEnvelope> {
        lock_recovering(&self.topics)
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_HUB_CAPACITY).0)
            .clone()
    }
}

/// One peer's view of the local mesh.
pub struct LocalNetwork {
    hub: Arc<LocalNetworkHub>,
    signer: Arc<OperatorSigner>,
}

impl LocalNetwork {
    pub fn new(hub: Arc<LocalNetworkHub>, signer: Arc<OperatorSigner>) -> Self {
        Self { hub, signer }
    }
}

impl NetworkProvider for LocalNetwork {
    fn broadcast_channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>> {
        let channel = LocalBroadcastChannel::new(name.to_string(), self.hub.clone(), self.signer.clone());
        Ok(Arc::new(channel))
    }
}

struct ChannelShared {
    name: String,
    handlers: Mutex<Vec<MessageHandler>>,
    unmarshalers: Mutex<HashMap<&'static str, UnmarshalFn>>,
    filter: Mutex<Option<BroadcastChannelFilter>>,
}

impl ChannelShared {
    /// Runs one inbound frame through the acceptance pipeline: signature,
    /// membership filter, unmarshaler lookup. Failures drop the frame
    /// silently, at most a debug log.
    fn process(&self, envelope: TransportEnvelope) {
        if envelope.channel != self.name {
            return;
        }

        let sender_public_key = match PublicKey::from_slice(&envelope.sender_public_key) {
            Ok(key) => key,
            Err(_) => {
                debug!("channel={} dropping frame with malformed sender key", self.name);
                return;
            }
        };

        let digest = envelope_digest(&envelope.channel, &envelope.message_type, &envelope.payload);
        match verify_signature(&digest, &envelope.signature, &sender_public_key) {
            Ok(true) => {}
            _ => {
                debug!("channel={} dropping frame with invalid signature", self.name);
                return;
            }
        }

        {
            let filter = lock_recovering(&self.filter);
            if let Some(filter) = filter.as_ref() {
                if !filter(&sender_public_key) {
                    trace!("channel={} sender filtered out", self.name);
                    return;
                }
            }
        }

        let payload: Arc<dyn ProtocolMessage> = {
            let unmarshalers = lock_recovering(&self.unmarshalers);
            let unmarshal = match unmarshalers.get(envelope.message_type.as_str()) {
                Some(unmarshal) => unmarshal,
                None => {
                    trace!("channel={} unknown message type {}", self.name, envelope.message_type);
                    return;
                }
            };
            match unmarshal(&envelope.payload) {
                Ok(message) => Arc::from(message),
                Err(err) => {
                    debug!("channel={} failed to unmarshal {}: {}", self.name, envelope.message_type, err);
                    return;
                }
            }
        };

        let message = ReceivedMessage { sender_public_key, payload };

        // Handlers fire concurrently, never on the reader task's stack.
        let handlers: Vec<Arc<dyn Fn(ReceivedMessage) + Send + Sync>> = lock_recovering(&self.handlers)
            .iter()
            .filter(|handler| handler.message_type == envelope.message_type)
            .map(|handler| handler.handler.clone())
            .collect();

        for handler in handlers {
            let message = message.clone();
            tokio::spawn(async move { handler(message) });
        }
    }
}

pub struct LocalBroadcastChannel {
    shared: Arc<ChannelShared>,
    sender: broadcast::Sender<TransportEnvelope>,
    signer: Arc<OperatorSigner>,
}

impl LocalBroadcastChannel {
    fn new(name: String, hub: Arc<LocalNetworkHub>, signer: Arc<OperatorSigner>) -> Self {
        let sender = hub.topic(&name);
        let shared = Arc::new(ChannelShared {
            name,
            handlers: Mutex::new(Vec::new()),
            unmarshalers: Mutex::new(HashMap::new()),
            filter: Mutex::new(None),
        });

        let mut receiver = sender.subscribe();
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => reader_shared.process(envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("channel={} reader lagged, {} frames lost", reader_shared.name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { shared, sender, signer }
    }
}

#[async_trait]
impl BroadcastChannel for LocalBroadcastChannel {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn send(&self, message: &dyn ProtocolMessage) -> Result<()> {
        let payload = message.marshal()?;
        let digest = envelope_digest(&self.shared.name, message.message_type(), &payload);
        let signature = self.signer.sign(&digest)?;

        let envelope = TransportEnvelope {
            channel: self.shared.name.clone(),
            message_type: message.message_type().to_string(),
            payload,
            sender_public_key: self.signer.public_key().serialize().to_vec(),
            signature,
        };

        // Publishing to a topic with no peers is not an error.
        let _ = self.sender.send(envelope);
        Ok(())
    }

    fn recv(&self, handler: MessageHandler) {
        lock_recovering(&self.shared.handlers).push(handler);
    }

    fn unregister_recv(&self, message_type: &str) {
        lock_recovering(&self.shared.handlers).retain(|handler| handler.message_type != message_type);
    }

    fn set_filter(&self, filter: BroadcastChannelFilter) {
        *lock_recovering(&self.shared.filter) = Some(filter);
    }

    fn register_unmarshaler(&self, message_type: &'static str, unmarshal: UnmarshalFn) {
        lock_recovering(&self.shared.unmarshalers).insert(message_type, unmarshal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Ping {
        nonce: u64,
    }

    impl ProtocolMessage for Ping {
        fn message_type(&self) -> &'static str {
            "test/ping"
        }

        fn marshal(&self) -> Result<Vec<u8>> {
            Ok(bincode::serialize(self)?)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn register_ping_unmarshaler(channel: &dyn BroadcastChannel) {
        channel.register_unmarshaler(
            "test/ping",
            Box::new(|payload| Ok(Box::new(bincode::deserialize::<Ping>(payload)?) as Box<dyn ProtocolMessage>)),
        );
    }

    fn forwarding_handler(sender: mpsc::UnboundedSender<(PublicKey, u64)>) -> MessageHandler {
        MessageHandler {
            message_type: "test/ping",
            handler: Arc::new(move |message: ReceivedMessage| {
                if let Some(ping) = message.payload_as::<Ping>() {
                    let _ = sender.send((message.sender_public_key, ping.nonce));
                }
            }),
        }
    }

    async fn recv_with_timeout(receiver: &mut mpsc::UnboundedReceiver<(PublicKey, u64)>) -> Option<(PublicKey, u64)> {
        tokio::time::timeout(Duration::from_millis(500), receiver.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn frames_reach_registered_handlers_on_all_peers() {
        let hub = LocalNetworkHub::new();
        let alice = Arc::new(OperatorSigner::generate());
        let bob = Arc::new(OperatorSigner::generate());

        let alice_channel =
            LocalNetwork::new(hub.clone(), alice.clone()).broadcast_channel_for("dkg-test").expect("channel");
        let bob_channel = LocalNetwork::new(hub.clone(), bob.clone()).broadcast_channel_for("dkg-test").expect("channel");
        register_ping_unmarshaler(bob_channel.as_ref());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        bob_channel.recv(forwarding_handler(sender));

        alice_channel.send(&Ping { nonce: 7 }).await.expect("send");

        let (from, nonce) = recv_with_timeout(&mut receiver).await.expect("delivered");
        assert_eq!(from, alice.public_key());
        assert_eq!(nonce, 7);
    }

    #[tokio::test]
    async fn unregister_recv_removes_all_handlers_of_the_type() {
        let hub = LocalNetworkHub::new();
        let signer = Arc::new(OperatorSigner::generate());
        let channel = LocalNetwork::new(hub, signer).broadcast_channel_for("unregister-test").expect("channel");
        register_ping_unmarshaler(channel.as_ref());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        channel.recv(forwarding_handler(sender.clone()));
        channel.recv(forwarding_handler(sender));

        channel.unregister_recv("test/ping");
        channel.send(&Ping { nonce: 1 }).await.expect("send");

        assert!(recv_with_timeout(&mut receiver).await.is_none(), "no handler of the type may fire");
    }

    #[tokio::test]
    async fn membership_filter_drops_foreign_senders() {
        let hub = LocalNetworkHub::new();
        let member = Arc::new(OperatorSigner::generate());
        let outsider = Arc::new(OperatorSigner::generate());
        let receiver_signer = Arc::new(OperatorSigner::generate());

        let member_channel =
            LocalNetwork::new(hub.clone(), member.clone()).broadcast_channel_for("filter-test").expect("channel");
        let outsider_channel =
            LocalNetwork::new(hub.clone(), outsider.clone()).broadcast_channel_for("filter-test").expect("channel");
        let receiving_channel =
            LocalNetwork::new(hub.clone(), receiver_signer).broadcast_channel_for("filter-test").expect("channel");
        register_ping_unmarshaler(receiving_channel.as_ref());

        let member_key = member.public_key();
        receiving_channel.set_filter(Box::new(move |sender| *sender == member_key));

        let (sender, mut receiver) = mpsc::unbounded_channel();
        receiving_channel.recv(forwarding_handler(sender));

        outsider_channel.send(&Ping { nonce: 13 }).await.expect("send");
        member_channel.send(&Ping { nonce: 42 }).await.expect("send");

        // Only the member's message arrives, the outsider's frame is
        // silently dropped.
        let (from, nonce) = recv_with_timeout(&mut receiver).await.expect("delivered");
        assert_eq!(from, member.public_key());
        assert_eq!(nonce, 42);
        assert!(recv_with_timeout(&mut receiver).await.is_none());
    }

    #[tokio::test]
    async fn unknown_message_type_is_dropped() {
        let hub = LocalNetworkHub::new();
        let signer = Arc::new(OperatorSigner::generate());
        let channel = LocalNetwork::new(hub, signer).broadcast_channel_for("tag-test").expect("channel");
        // No unmarshaler registered for "test/ping".

        let (sender, mut receiver) = mpsc::unbounded_channel();
        channel.recv(forwarding_handler(sender));
        channel.send(&Ping { nonce: 3 }).await.expect("send");

        assert!(recv_with_timeout(&mut receiver).await.is_none());
    }
}
