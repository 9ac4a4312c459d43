//! Host-chain event types and the subscription primitive.
//!
//! Subscriptions are bounded queues with an explicit unsubscribe handle.
//! Events are pushed by the chain facade's emitting task and pulled by the
//! consumer; user code never runs on the emitting task's stack.

use crate::domain::wallet::{DepositSweepProposal, HeartbeatProposal, RedemptionProposal};
use crate::foundation::{ChainAddress, Hash32, MemberIndex, WalletId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const SUBSCRIPTION_QUEUE_CAPACITY: usize = 256;

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of live subscriptions for one event type.
pub(crate) struct Subscribers<E> {
    senders: Arc<Mutex<HashMap<u64, mpsc::Sender<E>>>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + 'static> Subscribers<E> {
    pub(crate) fn new() -> Self {
        Self { senders: Arc::new(Mutex::new(HashMap::new())), next_id: AtomicU64::new(1) }
    }

    pub(crate) fn subscribe(&self) -> EventSubscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        lock_recovering(&self.senders).insert(id, sender);
        EventSubscription { receiver, id, senders: Arc::clone(&self.senders) }
    }

    /// Delivers the event to every live subscription. A subscriber that does
    /// not drain its queue loses events rather than blocking the emitter.
    pub(crate) fn publish(&self, event: &E) {
        let senders: Vec<mpsc::Sender<E>> = lock_recovering(&self.senders).values().cloned().collect();
        for sender in senders {
            let _ = sender.try_send(event.clone());
        }
    }
}

impl<E: Clone + Send + 'static> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an event subscription. Dropping the handle (or calling
/// `unsubscribe`) releases the queue; no further event is delivered after
/// `unsubscribe` returns.
pub struct EventSubscription<E> {
    receiver: mpsc::Receiver<E>,
    id: u64,
    senders: Arc<Mutex<HashMap<u64, mpsc::Sender<E>>>>,
}

impl<E> EventSubscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop does the unregistration.
    }
}

impl<E> Drop for EventSubscription<E> {
    fn drop(&mut self) {
        lock_recovering(&self.senders).remove(&self.id);
        self.receiver.close();
    }
}

#[derive(Clone, Debug)]
pub struct DkgStartedEvent {
    pub seed: Hash32,
    pub block_number: u64,
}

#[derive(Clone, Debug, Default)]
pub struct DkgStartedEventFilter {
    pub start_block: u64,
    pub end_block: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct DkgResultSubmittedEvent {
    pub result_hash: Hash32,
    pub group_public_key: Vec<u8>,
    pub misbehaved_members_indexes: Vec<MemberIndex>,
    pub block_number: u64,
}

#[derive(Clone, Debug)]
pub struct DkgResultChallengedEvent {
    pub result_hash: Hash32,
    pub challenger: ChainAddress,
    pub reason: String,
    pub block_number: u64,
}

#[derive(Clone, Debug)]
pub struct DkgResultApprovedEvent {
    pub result_hash: Hash32,
    pub approver: ChainAddress,
    pub block_number: u64,
}

#[derive(Clone, Debug)]
pub struct HeartbeatRequestedEvent {
    pub wallet_id: WalletId,
    pub proposal: HeartbeatProposal,
    pub block_number: u64,
}

#[derive(Clone, Debug)]
pub struct RedemptionProposalSubmittedEvent {
    pub wallet_id: WalletId,
    pub proposal: RedemptionProposal,
    pub block_number: u64,
}

#[derive(Clone, Debug)]
pub struct DepositSweepProposalSubmittedEvent {
    pub wallet_id: WalletId,
    pub proposal: DepositSweepProposal,
    pub proposal_submitter: ChainAddress,
    pub block_number: u64,
}

#[derive(Clone, Debug)]
pub struct MovingFundsCommitmentSubmittedEvent {
    pub wallet_id: WalletId,
    pub target_wallets: Vec<WalletId>,
    pub block_number: u64,
}

/// Block-range filter used by the historical proposal queries. Events are
/// returned in ascending block order.
#[derive(Clone, Debug, Default)]
pub struct ProposalEventFilter {
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub wallet_id: Option<WalletId>,
}

impl ProposalEventFilter {
    pub fn matches(&self, block_number: u64, wallet_id: &WalletId) -> bool {
        if block_number < self.start_block {
            return false;
        }
        if let Some(end_block) = self.end_block {
            if block_number > end_block {
                return false;
            }
        }
        match &self.wallet_id {
            Some(filtered) => filtered == wallet_id,
            None => true,
        }
    }
}
