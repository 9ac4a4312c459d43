//! Moving funds action: a wallet leaving the Live fleet transfers its whole
//! main UTXO to the committed target wallets. The target-wallet commitment
//! is submitted on-chain first and must be included before the Bitcoin
//! transaction is signed.

use crate::application::actions::{
    advance_action, determine_wallet_main_utxo, ensure_wallet_synced_between_chains, WalletSigningExecutor,
    WalletTransactionExecutor,
};
use crate::domain::redemption::UnsignedBitcoinTransaction;
use crate::domain::wallet::{ActionState, MovingFundsProposal, Signer, UnspentTransactionOutput, WalletState};
use crate::foundation::{
    BridgeError, MemberIndex, OperatorId, Result, WalletId, MOVING_FUNDS_COMMITMENT_INCLUSION_BLOCKS,
    MOVING_FUNDS_COMMITMENT_LOOK_BACK_BLOCKS, MOVING_FUNDS_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
};
use crate::infrastructure::bitcoin::BitcoinChain;
use crate::infrastructure::chain::{Chain, ProposalEventFilter};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, WPubkeyHash, Witness};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

const MOVING_FUNDS_BROADCAST_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const MOVING_FUNDS_BROADCAST_CHECK_DELAY: Duration = Duration::from_secs(60);

pub struct MovingFundsAction {
    chain: Arc<dyn Chain>,
    btc_chain: Arc<dyn BitcoinChain>,
    wallet: Signer,
    signing_executor: Arc<dyn WalletSigningExecutor>,
    proposal: MovingFundsProposal,
    proposal_processing_start_block: u64,
    proposal_expiry_block: u64,
    broadcast_timeout: Duration,
    broadcast_check_delay: Duration,
}

impl MovingFundsAction {
    pub fn new(
        chain: Arc<dyn Chain>,
        btc_chain: Arc<dyn BitcoinChain>,
        wallet: Signer,
        signing_executor: Arc<dyn WalletSigningExecutor>,
        proposal: MovingFundsProposal,
        proposal_processing_start_block: u64,
        proposal_expiry_block: u64,
    ) -> Self {
        Self {
            chain,
            btc_chain,
            wallet,
            signing_executor,
            proposal,
            proposal_processing_start_block,
            proposal_expiry_block,
            broadcast_timeout: MOVING_FUNDS_BROADCAST_TIMEOUT,
            broadcast_check_delay: MOVING_FUNDS_BROADCAST_CHECK_DELAY,
        }
    }

    pub fn with_broadcast_timing(mut self, timeout: Duration, check_delay: Duration) -> Self {
        self.broadcast_timeout = timeout;
        self.broadcast_check_delay = check_delay;
        self
    }

    pub async fn execute(&self) -> Result<Transaction> {
        let wallet_id = self.wallet.wallet_id()?;
        let mut state = ActionState::Proposed;

        let wallet_data = self.chain.get_wallet(&wallet_id).await?;
        if wallet_data.state != WalletState::MovingFunds {
            return Err(BridgeError::ProposalInvalid("source wallet not in MovingFunds state".to_string()));
        }
        if wallet_data.pending_redemptions_value > 0 {
            return Err(BridgeError::ProposalInvalid("source wallet has pending redemptions".to_string()));
        }
        if wallet_data.pending_moved_funds_sweep_requests_count > 0 {
            return Err(BridgeError::ProposalInvalid("source wallet has pending moved funds sweep requests".to_string()));
        }

        if self.proposal.target_wallets.is_empty() {
            return Err(BridgeError::NotEnoughTargetWallets { required: 1, found: 0 });
        }

        let main_utxo = determine_wallet_main_utxo(&wallet_id, self.chain.as_ref(), self.btc_chain.as_ref())
            .await?
            .ok_or(BridgeError::MainUtxoNotFound)?;
        ensure_wallet_synced_between_chains(&wallet_id, &main_utxo, self.chain.as_ref(), self.btc_chain.as_ref()).await?;

        let wallet_parameters = self.chain.get_wallet_parameters().await?;
        if wallet_parameters.wallet_max_btc_transfer == 0 {
            return Err(BridgeError::MaxBtcTransferZero);
        }

        let required_targets = main_utxo.value.div_ceil(wallet_parameters.wallet_max_btc_transfer) as usize;
        let live_wallets = self.chain.get_live_wallets_count().await? as usize;
        let required_targets = required_targets.min(live_wallets.max(1));
        if self.proposal.target_wallets.len() < required_targets {
            return Err(BridgeError::NotEnoughTargetWallets {
                required: required_targets,
                found: self.proposal.target_wallets.len(),
            });
        }

        self.ensure_commitment(&wallet_id, &wallet_data.moving_funds_target_wallets_commitment_hash, &main_utxo).await?;
        advance_action(&wallet_id, &mut state, ActionState::Validated);

        let unsigned =
            assemble_moving_funds_transaction(&main_utxo, &self.proposal.target_wallets, self.proposal.moving_funds_tx_fee)?;
        advance_action(&wallet_id, &mut state, ActionState::Assembled);

        if self.proposal_expiry_block < MOVING_FUNDS_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS {
            return Err(BridgeError::InvalidProposalExpiry {
                expiry_block: self.proposal_expiry_block,
                safety_margin: MOVING_FUNDS_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            });
        }

        let executor = WalletTransactionExecutor::new(self.btc_chain.as_ref(), &self.wallet, self.signing_executor.as_ref());

        let transaction = executor
            .sign_transaction(
                &unsigned,
                self.proposal_processing_start_block,
                self.proposal_expiry_block - MOVING_FUNDS_SIGNING_TIMEOUT_SAFETY_MARGIN_BLOCKS,
            )
            .await?;
        advance_action(&wallet_id, &mut state, ActionState::Signed);

        executor.broadcast_transaction(&transaction, self.broadcast_timeout, self.broadcast_check_delay).await?;
        advance_action(&wallet_id, &mut state, ActionState::Broadcast);
        advance_action(&wallet_id, &mut state, ActionState::Confirmed);

        info!(
            "wallet={} moving funds transaction [{}] targets [{}] wallets",
            wallet_id,
            transaction.compute_txid(),
            self.proposal.target_wallets.len(),
        );
        Ok(transaction)
    }

    /// Makes sure the target-wallet commitment is on-chain and matches the
    /// proposal. When no commitment exists yet this member submits one and
    /// waits a bounded number of blocks for its inclusion.
    async fn ensure_commitment(
        &self,
        wallet_id: &WalletId,
        commitment_hash: &[u8; 32],
        main_utxo: &UnspentTransactionOutput,
    ) -> Result<()> {
        let expected_hash = self.chain.compute_moving_funds_commitment_hash(&self.proposal.target_wallets);

        if *commitment_hash != [0u8; 32] {
            if !bool::from(expected_hash.ct_eq(commitment_hash)) {
                self.log_committed_target_wallets(wallet_id, commitment_hash).await;
                return Err(BridgeError::WrongCommitmentHash);
            }
            return Ok(());
        }

        let (member_ids, member_index) = self.wallet_members_info().await?;
        info!("wallet={} submitting moving funds commitment as member [{}]", wallet_id, member_index);
        self.chain
            .submit_moving_funds_commitment(wallet_id, main_utxo, &member_ids, member_index, &self.proposal.target_wallets)
            .await?;

        // Wait for the commitment to land; the submission transaction may
        // take a few blocks to be included.
        let block_counter = self.chain.block_counter();
        let submitted_at = block_counter.current_block().await?;
        for block in submitted_at..=submitted_at + MOVING_FUNDS_COMMITMENT_INCLUSION_BLOCKS {
            let wallet = self.chain.get_wallet(wallet_id).await?;
            if wallet.moving_funds_target_wallets_commitment_hash != [0u8; 32] {
                if !bool::from(expected_hash.ct_eq(&wallet.moving_funds_target_wallets_commitment_hash)) {
                    return Err(BridgeError::WrongCommitmentHash);
                }
                return Ok(());
            }
            block_counter.wait_for_block(block + 1).await?;
        }

        Err(BridgeError::CommitmentNotIncluded)
    }

    /// Recovers the committed target wallet list from past commitment
    /// events so the mismatch gets logged with what was actually committed.
    async fn log_committed_target_wallets(&self, wallet_id: &WalletId, commitment_hash: &[u8; 32]) {
        let Ok(current_block) = self.chain.block_counter().current_block().await else { return };

        let filter = ProposalEventFilter {
            start_block: current_block.saturating_sub(MOVING_FUNDS_COMMITMENT_LOOK_BACK_BLOCKS),
            end_block: None,
            wallet_id: Some(*wallet_id),
        };
        let Ok(events) = self.chain.past_moving_funds_commitment_submitted_events(&filter).await else { return };

        let committed = events.iter().rev().find(|event| {
            let hash = self.chain.compute_moving_funds_commitment_hash(&event.target_wallets);
            bool::from(hash.ct_eq(commitment_hash))
        });

        if let Some(event) = committed {
            let targets: Vec<String> = event.target_wallets.iter().map(|target| target.to_string()).collect();
            log::warn!(
                "wallet={} proposal targets differ from the committed target wallets [{}]",
                wallet_id,
                targets.join(", "),
            );
        }
    }

    /// Operator IDs of all wallet members plus this member's 1-based index
    /// among them. The executing operator must be one of the wallet's
    /// operators.
    async fn wallet_members_info(&self) -> Result<(Vec<OperatorId>, MemberIndex)> {
        let executing_operator = self.chain.operator_address();
        let mut member_ids = Vec::with_capacity(self.wallet.signing_group_operators.len());
        let mut member_index: Option<MemberIndex> = None;

        for (position, operator) in self.wallet.signing_group_operators.iter().enumerate() {
            if *operator == executing_operator && member_index.is_none() {
                member_index = Some(position as MemberIndex + 1);
            }
            member_ids.push(self.chain.get_operator_id(operator).await?);
        }

        let member_index = member_index.ok_or(BridgeError::NoExecutingOperator)?;
        Ok((member_ids, member_index))
    }
}

/// Builds the unsigned moving funds transaction: the whole main UTXO split
/// evenly across the target wallets, remainder on the last output, no
/// change.
pub fn assemble_moving_funds_transaction(
    main_utxo: &UnspentTransactionOutput,
    target_wallets: &[WalletId],
    fee: u64,
) -> Result<UnsignedBitcoinTransaction> {
    if target_wallets.is_empty() {
        return Err(BridgeError::NotEnoughTargetWallets { required: 1, found: 0 });
    }

    let distributable = main_utxo
        .value
        .checked_sub(fee)
        .filter(|value| *value > 0)
        .ok_or_else(|| BridgeError::ProposalInvalid("main UTXO does not cover the fee".to_string()))?;

    let count = target_wallets.len() as u64;
    let per_target = distributable / count;
    let remainder = distributable % count;

    let outputs = target_wallets
        .iter()
        .enumerate()
        .map(|(position, target)| {
            let mut value = per_target;
            if position == target_wallets.len() - 1 {
                value += remainder;
            }
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(*target.as_bytes())),
            }
        })
        .collect();

    let transaction = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: main_utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    };

    Ok(UnsignedBitcoinTransaction { transaction, input_values: vec![main_utxo.value] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;

    fn main_utxo(value: u64) -> UnspentTransactionOutput {
        UnspentTransactionOutput::new(Txid::from_byte_array([0x31; 32]), 1, value)
    }

    #[test]
    fn funds_split_evenly_with_remainder_on_last_target() {
        let targets = vec![WalletId::new([1; 20]), WalletId::new([2; 20]), WalletId::new([3; 20])];
        let unsigned = assemble_moving_funds_transaction(&main_utxo(1_000_001), &targets, 1_000).expect("assembled");

        let values: Vec<u64> = unsigned.transaction.output.iter().map(|output| output.value.to_sat()).collect();
        assert_eq!(values, vec![333_000, 333_000, 333_001]);
        assert_eq!(values.iter().sum::<u64>(), 999_001);
    }

    #[test]
    fn every_output_pays_a_target_wallet() {
        let targets = vec![WalletId::new([7; 20]), WalletId::new([8; 20])];
        let unsigned = assemble_moving_funds_transaction(&main_utxo(500_000), &targets, 500).expect("assembled");

        for (output, target) in unsigned.transaction.output.iter().zip(&targets) {
            assert_eq!(output.script_pubkey, ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(*target.as_bytes())));
        }
    }

    #[test]
    fn fee_must_be_covered() {
        let targets = vec![WalletId::new([1; 20])];
        assert!(assemble_moving_funds_transaction(&main_utxo(400), &targets, 500).is_err());
    }
}
