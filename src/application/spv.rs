//! SPV maintainer: discovers unproven deposit sweep transactions of recently
//! active wallets, assembles their proofs, and submits them with
//! reimbursement. Runs as an independent periodic loop.

use crate::domain::spv::{classify_sweep_candidate, unique_wallet_ids, SweepClassification, SweepInputKind};
use crate::domain::wallet::UnspentTransactionOutput;
use crate::foundation::{Result, WalletId, SPV_PROPOSAL_LOOK_BACK_BLOCKS, SPV_WALLET_TRANSACTION_LIMIT};
use crate::infrastructure::bitcoin::{assemble_spv_proof, BitcoinChain};
use crate::infrastructure::chain::{Chain, ProposalEventFilter};
use crate::infrastructure::config::SpvConfig;
use bitcoin::Transaction;
use log::{debug, info, warn};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::time::sleep;

pub struct SpvMaintainer {
    chain: Arc<dyn Chain>,
    btc_chain: Arc<dyn BitcoinChain>,
    config: SpvConfig,
}

impl SpvMaintainer {
    pub fn new(chain: Arc<dyn Chain>, btc_chain: Arc<dyn BitcoinChain>, config: SpvConfig) -> Self {
        Self { chain, btc_chain, config }
    }

    /// Control loop: prove, back off, repeat. An internal error restarts the
    /// loop after the restart back-off instead of killing the maintainer.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("starting SPV maintainer");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let back_off = match self.prove_deposit_sweep_transactions().await {
                Ok(()) => self.config.idle_back_off(),
                Err(err) => {
                    warn!("error while maintaining SPV: {}; restarting maintainer", err);
                    self.config.restart_back_off()
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(back_off) => {}
            }
        }

        info!("stopping SPV maintainer");
    }

    /// One proving round. A failure on a single transaction is logged and
    /// does not abort the batch.
    pub async fn prove_deposit_sweep_transactions(&self) -> Result<()> {
        let transactions = self.unproven_deposit_sweep_transactions().await?;
        if transactions.is_empty() {
            debug!("no unproven deposit sweep transactions found");
            return Ok(());
        }

        let required_confirmations = self.chain.tx_proof_difficulty_factor().await?;

        for (wallet_id, transaction) in transactions {
            if let Err(err) = self.prove_transaction(&wallet_id, &transaction, required_confirmations).await {
                warn!(
                    "failed to prove deposit sweep transaction [{}] of wallet [{}]: {}",
                    transaction.compute_txid(),
                    wallet_id,
                    err,
                );
            }
        }

        Ok(())
    }

    async fn prove_transaction(
        &self,
        wallet_id: &WalletId,
        transaction: &Transaction,
        required_confirmations: u64,
    ) -> Result<()> {
        let txid = transaction.compute_txid();
        let (transaction, proof) = assemble_spv_proof(&txid, required_confirmations, self.btc_chain.as_ref()).await?;

        // The main UTXO consumed by the sweep, if any, accompanies the proof.
        let mut main_utxo = None;
        for input in &transaction.input {
            if let Some(utxo) = self.input_as_wallet_main_utxo(input, wallet_id).await? {
                main_utxo = Some(utxo);
                break;
            }
        }

        self.chain
            .submit_deposit_sweep_proof_with_reimbursement(&transaction, &proof, main_utxo.as_ref(), None)
            .await?;

        info!("submitted deposit sweep proof for transaction [{}] of wallet [{}]", txid, wallet_id);
        Ok(())
    }

    /// Finds candidate transactions: wallets named by recent sweep proposals,
    /// their latest Bitcoin transactions, filtered down to unproven sweeps.
    async fn unproven_deposit_sweep_transactions(&self) -> Result<Vec<(WalletId, Transaction)>> {
        let current_block = self.chain.block_counter().current_block().await?;
        let start_block = current_block.saturating_sub(SPV_PROPOSAL_LOOK_BACK_BLOCKS);

        let proposals = self
            .chain
            .past_deposit_sweep_proposal_submitted_events(&ProposalEventFilter {
                start_block,
                ..Default::default()
            })
            .await?;

        let wallet_ids = unique_wallet_ids(proposals.into_iter().map(|event| event.wallet_id));

        let mut unproven = Vec::new();
        for wallet_id in wallet_ids {
            let transactions = self
                .btc_chain
                .get_transactions_for_public_key_hash(wallet_id.as_bytes(), SPV_WALLET_TRANSACTION_LIMIT)
                .await?;

            for transaction in transactions {
                match self.classify_transaction(&wallet_id, &transaction).await? {
                    SweepClassification::Unproven => unproven.push((wallet_id, transaction)),
                    SweepClassification::AlreadyProven | SweepClassification::NotDepositSweep => {}
                }
            }
        }

        Ok(unproven)
    }

    async fn classify_transaction(&self, wallet_id: &WalletId, transaction: &Transaction) -> Result<SweepClassification> {
        let mut input_kinds = Vec::with_capacity(transaction.input.len());

        for input in &transaction.input {
            let outpoint = input.previous_output;
            let deposit = self.chain.deposits(&outpoint.txid, outpoint.vout).await?;

            let kind = if deposit.is_revealed() {
                if deposit.is_swept() {
                    SweepInputKind::SweptDeposit
                } else {
                    SweepInputKind::UnsweptDeposit
                }
            } else if self.input_as_wallet_main_utxo(input, wallet_id).await?.is_some() {
                SweepInputKind::WalletMainUtxo
            } else {
                SweepInputKind::Other
            };
            input_kinds.push(kind);
        }

        Ok(classify_sweep_candidate(transaction.output.len(), &input_kinds))
    }

    /// Resolves an input against the wallet's current main UTXO hash. Only
    /// one input can possibly match since only one outpoint hashes to the
    /// committed value.
    async fn input_as_wallet_main_utxo(
        &self,
        input: &bitcoin::TxIn,
        wallet_id: &WalletId,
    ) -> Result<Option<UnspentTransactionOutput>> {
        let outpoint = input.previous_output;

        let funding_transaction = match self.btc_chain.get_transaction(&outpoint.txid).await {
            Ok(transaction) => transaction,
            Err(_) => return Ok(None),
        };
        let value = match funding_transaction.output.get(outpoint.vout as usize) {
            Some(output) => output.value.to_sat(),
            None => return Ok(None),
        };

        let candidate = UnspentTransactionOutput::new(outpoint.txid, outpoint.vout, value);
        let candidate_hash = self.chain.compute_main_utxo_hash(&candidate);

        let wallet = self.chain.get_wallet(wallet_id).await?;
        if bool::from(candidate_hash.ct_eq(&wallet.main_utxo_hash)) {
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }
}
