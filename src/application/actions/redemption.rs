//! Redemption action: pays pending redemption requests out of the wallet's
//! main UTXO within the proposal validity window.

use crate::application::actions::{
    advance_action, determine_wallet_main_utxo, ensure_wallet_synced_between_chains, WalletSigningExecutor,
    WalletTransactionExecutor,
};
use crate::domain::redemption::{
    assemble_redemption_transaction, RedemptionRequest, RedemptionTransactionShape,
};
use crate::domain::wallet::{ActionState, RedemptionProposal, Signer};
use crate::foundation::{
    BridgeError, Result, WalletId, REDEMPTION_BROADCAST_CHECK_DELAY, REDEMPTION_BROADCAST_TIMEOUT,
    REDEMPTION_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
};
use crate::infrastructure::bitcoin::BitcoinChain;
use crate::infrastructure::chain::Chain;
use bitcoin::Transaction;
use log::info;
use secp256k1::PublicKey;
use std::sync::Arc;
use std::time::Duration;

pub struct RedemptionAction {
    chain: Arc<dyn Chain>,
    btc_chain: Arc<dyn BitcoinChain>,
    wallet: Signer,
    wallet_public_key: PublicKey,
    signing_executor: Arc<dyn WalletSigningExecutor>,
    proposal: RedemptionProposal,
    proposal_processing_start_block: u64,
    proposal_expiry_block: u64,
    signing_timeout_safety_margin_blocks: u64,
    broadcast_timeout: Duration,
    broadcast_check_delay: Duration,
    transaction_shape: RedemptionTransactionShape,
}

impl RedemptionAction {
    pub fn new(
        chain: Arc<dyn Chain>,
        btc_chain: Arc<dyn BitcoinChain>,
        wallet: Signer,
        signing_executor: Arc<dyn WalletSigningExecutor>,
        proposal: RedemptionProposal,
        proposal_processing_start_block: u64,
        proposal_expiry_block: u64,
    ) -> Result<Self> {
        let wallet_public_key = PublicKey::from_slice(&wallet.wallet_public_key)?;
        Ok(Self {
            chain,
            btc_chain,
            wallet,
            wallet_public_key,
            signing_executor,
            proposal,
            proposal_processing_start_block,
            proposal_expiry_block,
            signing_timeout_safety_margin_blocks: REDEMPTION_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            broadcast_timeout: REDEMPTION_BROADCAST_TIMEOUT,
            broadcast_check_delay: REDEMPTION_BROADCAST_CHECK_DELAY,
            transaction_shape: RedemptionTransactionShape::ChangeFirst,
        })
    }

    /// Overrides the broadcast timing; the defaults suit production block
    /// times.
    pub fn with_broadcast_timing(mut self, timeout: Duration, check_delay: Duration) -> Self {
        self.broadcast_timeout = timeout;
        self.broadcast_check_delay = check_delay;
        self
    }

    pub async fn execute(&self) -> Result<Transaction> {
        let wallet_id = self.wallet.wallet_id()?;
        let mut state = ActionState::Proposed;

        let requests = validate_redemption_proposal(&wallet_id, &self.proposal, self.chain.as_ref()).await?;
        advance_action(&wallet_id, &mut state, ActionState::Validated);

        let main_utxo = determine_wallet_main_utxo(&wallet_id, self.chain.as_ref(), self.btc_chain.as_ref())
            .await?
            // Proposal validation already requires a confirmed main UTXO.
            .ok_or(BridgeError::MainUtxoNotFound)?;

        ensure_wallet_synced_between_chains(&wallet_id, &main_utxo, self.chain.as_ref(), self.btc_chain.as_ref()).await?;

        let unsigned = assemble_redemption_transaction(
            &self.wallet_public_key,
            &main_utxo,
            &requests,
            self.proposal.redemption_tx_fee,
            self.transaction_shape,
        )?;
        advance_action(&wallet_id, &mut state, ActionState::Assembled);

        // The expiry computed from the validity window always outlives the
        // safety margin.
        if self.proposal_expiry_block < self.signing_timeout_safety_margin_blocks {
            return Err(BridgeError::InvalidProposalExpiry {
                expiry_block: self.proposal_expiry_block,
                safety_margin: self.signing_timeout_safety_margin_blocks,
            });
        }

        let executor = WalletTransactionExecutor::new(self.btc_chain.as_ref(), &self.wallet, self.signing_executor.as_ref());

        let transaction = executor
            .sign_transaction(
                &unsigned,
                self.proposal_processing_start_block,
                self.proposal_expiry_block - self.signing_timeout_safety_margin_blocks,
            )
            .await?;
        advance_action(&wallet_id, &mut state, ActionState::Signed);

        executor.broadcast_transaction(&transaction, self.broadcast_timeout, self.broadcast_check_delay).await?;
        advance_action(&wallet_id, &mut state, ActionState::Broadcast);

        advance_action(&wallet_id, &mut state, ActionState::Confirmed);
        info!(
            "wallet={} redemption transaction [{}] pays [{}] requests",
            wallet_id,
            transaction.compute_txid(),
            requests.len(),
        );
        Ok(transaction)
    }
}

/// Checks the proposal with the on-chain validation rules and fetches the
/// pending request behind every redeemer output script. A missing request
/// fails the whole proposal.
pub async fn validate_redemption_proposal(
    wallet_id: &WalletId,
    proposal: &RedemptionProposal,
    chain: &dyn Chain,
) -> Result<Vec<RedemptionRequest>> {
    info!("wallet={} calling chain for redemption proposal validation", wallet_id);
    chain.validate_redemption_proposal(wallet_id, proposal).await?;
    info!("wallet={} redemption proposal is valid", wallet_id);

    let request_count = proposal.redeemers_output_scripts.len();
    let mut requests = Vec::with_capacity(request_count);

    for (position, script) in proposal.redeemers_output_scripts.iter().enumerate() {
        let request = chain
            .get_pending_redemption_request(wallet_id, script)
            .await?
            .ok_or(BridgeError::PendingRequestMissing { request_index: position + 1, request_count })?;
        requests.push(request);
    }

    Ok(requests)
}
