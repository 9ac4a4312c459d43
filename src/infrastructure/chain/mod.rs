//! Uniform view of the anchoring host chain consumed by the node: block
//! counter, operator signing, event subscriptions, historical queries, and
//! state mutators. Mutators are idempotent against re-submission of
//! identical payloads; the chain rejects duplicates, not the client.

mod events;
mod local;
mod signer;

pub use events::{
    DepositSweepProposalSubmittedEvent, DkgResultApprovedEvent, DkgResultChallengedEvent, DkgResultSubmittedEvent,
    DkgStartedEvent, DkgStartedEventFilter, EventSubscription, HeartbeatRequestedEvent,
    MovingFundsCommitmentSubmittedEvent, ProposalEventFilter, RedemptionProposalSubmittedEvent,
};
pub(crate) use events::Subscribers;
pub use local::LocalChain;
pub use signer::{verify_signature, OperatorSigner, Signing};

use crate::domain::dkg::DkgChainResult;
use crate::domain::group::{GroupParameters, GroupSelectionResult};
use crate::domain::redemption::RedemptionRequest;
use crate::domain::relay::RelayRequest;
use crate::domain::wallet::{DepositChainData, RedemptionProposal, UnspentTransactionOutput, WalletChainData, WalletLock};
use crate::foundation::{ChainAddress, Hash32, MemberIndex, OperatorId, Result, WalletId};
use crate::infrastructure::bitcoin::SpvProof;
use async_trait::async_trait;
use bitcoin::{ScriptBuf, Transaction, Txid};
use std::collections::BTreeMap;
use std::sync::Arc;

/// State of the on-chain DKG procedure. Transitions are driven by chain
/// events; the client never assumes a transition without a confirming event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DkgState {
    Idle,
    AwaitingSeed,
    AwaitingResult,
    Challenge,
}

/// DKG-specific control parameters of the chain.
#[derive(Clone, Copy, Debug)]
pub struct DkgParameters {
    pub submission_timeout_blocks: u64,
    pub challenge_period_blocks: u64,
    /// Block step of the result submission eligibility queue.
    pub result_publication_block_step: u64,
}

impl Default for DkgParameters {
    fn default() -> Self {
        Self { submission_timeout_blocks: 100, challenge_period_blocks: 100, result_publication_block_step: 6 }
    }
}

/// Wallet-related control parameters of the chain.
#[derive(Clone, Copy, Debug)]
pub struct WalletParameters {
    pub wallet_creation_period: u64,
    pub wallet_creation_min_btc_balance: u64,
    pub wallet_creation_max_btc_balance: u64,
    pub wallet_closure_min_btc_balance: u64,
    pub wallet_max_age: u64,
    pub wallet_max_btc_transfer: u64,
    pub wallet_closing_period: u64,
}

impl Default for WalletParameters {
    fn default() -> Self {
        Self {
            wallet_creation_period: 604_800,
            wallet_creation_min_btc_balance: 1_000_000,
            wallet_creation_max_btc_balance: 1_000_000_000,
            wallet_closure_min_btc_balance: 50_000,
            wallet_max_age: 23_328_000,
            wallet_max_btc_transfer: 1_000_000_000,
            wallet_closing_period: 3_888_000,
        }
    }
}

/// Chain block clock.
#[async_trait]
pub trait BlockCounter: Send + Sync {
    async fn current_block(&self) -> Result<u64>;
    /// Resolves once the chain height reaches `block`; resolves immediately
    /// when the chain is already past it.
    async fn wait_for_block(&self, block: u64) -> Result<u64>;
}

/// The interface the node expects to interact with the anchoring chain on.
#[async_trait]
pub trait Chain: Send + Sync {
    fn block_counter(&self) -> Arc<dyn BlockCounter>;
    fn signing(&self) -> Arc<dyn Signing>;
    fn operator_address(&self) -> ChainAddress;
    fn group_parameters(&self) -> GroupParameters;

    // === Group selection ===

    /// Returns the group members selected for the given seed. Fails when the
    /// chain's state does not allow group selection at the moment.
    async fn select_group(&self, seed: &Hash32) -> Result<GroupSelectionResult>;

    async fn get_operator_id(&self, operator: &ChainAddress) -> Result<OperatorId>;

    // === Distributed key generation ===

    fn on_dkg_started(&self) -> EventSubscription<DkgStartedEvent>;
    async fn past_dkg_started_events(&self, filter: &DkgStartedEventFilter) -> Result<Vec<DkgStartedEvent>>;
    fn on_dkg_result_submitted(&self) -> EventSubscription<DkgResultSubmittedEvent>;
    fn on_dkg_result_challenged(&self) -> EventSubscription<DkgResultChallengedEvent>;
    fn on_dkg_result_approved(&self) -> EventSubscription<DkgResultApprovedEvent>;

    async fn get_dkg_state(&self) -> Result<DkgState>;
    async fn dkg_parameters(&self) -> Result<DkgParameters>;

    /// The 32-byte hash members sign to support the given group public key
    /// computed as the result of the DKG started at `start_block`.
    fn calculate_dkg_result_signature_hash(
        &self,
        group_public_key: &[u8],
        misbehaved_members_indexes: &[MemberIndex],
        start_block: u64,
    ) -> Result<Hash32>;

    /// Assembles the DKG result according to the rules expected by the chain.
    async fn assemble_dkg_result(
        &self,
        submitter_member_index: MemberIndex,
        group_public_key: &[u8],
        operating_members_indexes: &[MemberIndex],
        misbehaved_members_indexes: &[MemberIndex],
        signatures: &BTreeMap<MemberIndex, Vec<u8>>,
        group_selection_result: &GroupSelectionResult,
    ) -> Result<DkgChainResult>;

    /// Whether the result is valid from the on-chain contract standpoint.
    async fn is_dkg_result_valid(&self, result: &DkgChainResult) -> Result<bool>;
    async fn submit_dkg_result(&self, result: &DkgChainResult) -> Result<()>;
    async fn challenge_dkg_result(&self, result: &DkgChainResult) -> Result<()>;
    async fn approve_dkg_result(&self, result: &DkgChainResult) -> Result<()>;

    // === Wallet coordination ===

    fn on_heartbeat_requested(&self) -> EventSubscription<HeartbeatRequestedEvent>;
    fn on_redemption_proposal_submitted(&self) -> EventSubscription<RedemptionProposalSubmittedEvent>;
    fn on_deposit_sweep_proposal_submitted(&self) -> EventSubscription<DepositSweepProposalSubmittedEvent>;

    async fn past_deposit_sweep_proposal_submitted_events(
        &self,
        filter: &ProposalEventFilter,
    ) -> Result<Vec<DepositSweepProposalSubmittedEvent>>;
    async fn past_moving_funds_commitment_submitted_events(
        &self,
        filter: &ProposalEventFilter,
    ) -> Result<Vec<MovingFundsCommitmentSubmittedEvent>>;

    async fn get_wallet(&self, wallet_id: &WalletId) -> Result<WalletChainData>;
    /// Current lock of the wallet; `None` when no action is in progress.
    async fn get_wallet_lock(&self, wallet_id: &WalletId) -> Result<Option<WalletLock>>;

    /// Validates the proposal against the on-chain rules; an error means the
    /// proposal must not be executed.
    async fn validate_redemption_proposal(&self, wallet_id: &WalletId, proposal: &RedemptionProposal) -> Result<()>;

    /// The pending redemption request for the given wallet and redeemer
    /// output script, or `None` when no such request exists.
    async fn get_pending_redemption_request(
        &self,
        wallet_id: &WalletId,
        redeemer_output_script: &ScriptBuf,
    ) -> Result<Option<RedemptionRequest>>;

    fn compute_main_utxo_hash(&self, utxo: &UnspentTransactionOutput) -> Hash32;
    fn compute_moving_funds_commitment_hash(&self, target_wallets: &[WalletId]) -> Hash32;

    async fn deposits(&self, funding_tx_hash: &Txid, funding_output_index: u32) -> Result<DepositChainData>;

    async fn submit_deposit_sweep_proof_with_reimbursement(
        &self,
        transaction: &Transaction,
        proof: &SpvProof,
        main_utxo: Option<&UnspentTransactionOutput>,
        vault: Option<ChainAddress>,
    ) -> Result<()>;

    /// Number of confirmations an SPV proof must span.
    async fn tx_proof_difficulty_factor(&self) -> Result<u64>;

    async fn submit_moving_funds_commitment(
        &self,
        wallet_id: &WalletId,
        wallet_main_utxo: &UnspentTransactionOutput,
        wallet_members_ids: &[OperatorId],
        wallet_member_index: MemberIndex,
        target_wallets: &[WalletId],
    ) -> Result<()>;

    async fn get_wallet_parameters(&self) -> Result<WalletParameters>;
    async fn get_live_wallets_count(&self) -> Result<u32>;

    // === Relay ===

    async fn current_relay_request(&self) -> Result<RelayRequest>;
    /// Makes an on-chain request for a new relay entry. Fails when another
    /// relay request is in progress.
    async fn request_relay_entry(&self, group_id: u64, previous_entry: &[u8]) -> Result<RelayRequest>;

    // === Sortition pool ===

    async fn operator_to_staking_provider(&self) -> Result<Option<ChainAddress>>;
    async fn is_operator_in_pool(&self) -> Result<bool>;
    async fn is_operator_up_to_date(&self) -> Result<bool>;
    async fn is_pool_locked(&self) -> Result<bool>;
    async fn join_sortition_pool(&self) -> Result<()>;
    async fn update_operator_status(&self) -> Result<()>;
    async fn is_eligible_for_rewards(&self) -> Result<bool>;
    async fn can_restore_reward_eligibility(&self) -> Result<bool>;
    async fn restore_reward_eligibility(&self) -> Result<()>;
}

/// Canonical hash of a wallet main UTXO as committed on the host chain.
pub fn main_utxo_hash(utxo: &UnspentTransactionOutput) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tideway:main_utxo:v1:");
    hasher.update(utxo.outpoint.txid.as_ref());
    hasher.update(&utxo.outpoint.vout.to_le_bytes());
    hasher.update(&utxo.value.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Canonical hash of a moving-funds target wallet commitment. The target
/// list is hashed in ascending order regardless of the input order.
pub fn moving_funds_commitment_hash(target_wallets: &[WalletId]) -> Hash32 {
    let mut sorted = target_wallets.to_vec();
    sorted.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tideway:moving_funds_commitment:v1:");
    for wallet in sorted {
        hasher.update(wallet.as_bytes());
    }
    *hasher.finalize().as_bytes()
}
