//! Redemption transaction assembly: fee distribution over the requested
//! redemptions and the shape of the produced Bitcoin transaction.

use crate::domain::wallet::{wallet_p2wpkh_script, UnspentTransactionOutput};
use crate::foundation::{BridgeError, ChainAddress, Result};
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

/// A pending redemption request registered on the host chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedemptionRequest {
    /// Redeemer's address on the host chain.
    pub redeemer: ChainAddress,
    /// Output script the redeemed funds are locked to. Not prepended with
    /// the byte-length of the script.
    pub redeemer_output_script: ScriptBuf,
    /// Amount (in satoshi) requested for redemption.
    pub requested_amount: u64,
    /// Treasury fee (in satoshi) at the moment of request creation.
    pub treasury_fee: u64,
    /// Maximum value of the per-redemption transaction fee (in satoshi).
    pub tx_max_fee: u64,
    /// UNIX timestamp of request creation.
    pub requested_at: u64,
}

/// Shape of a redemption transaction's output vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RedemptionTransactionShape {
    /// The change output is the first one in the output vector. The fixed
    /// change position keeps the on-chain proof of the transaction cheap.
    #[default]
    ChangeFirst,
    /// The change output is the last one in the output vector.
    ChangeLast,
}

/// A transaction assembled but not yet signed, together with the values of
/// its inputs required to compute segwit signature hashes.
#[derive(Clone, Debug)]
pub struct UnsignedBitcoinTransaction {
    pub transaction: Transaction,
    pub input_values: Vec<u64>,
}

impl UnsignedBitcoinTransaction {
    pub fn total_inputs_value(&self) -> u64 {
        self.input_values.iter().sum()
    }
}

/// Splits a total transaction fee evenly over `request_count` redemption
/// requests. When the fee cannot be divided evenly, the last request incurs
/// the remainder.
pub fn distribute_redemption_fee(total_fee: u64, request_count: usize) -> Vec<u64> {
    assert!(request_count > 0, "fee distribution requires at least one request");

    let count = request_count as u64;
    let remainder = total_fee % count;
    let fee_per_request = (total_fee - remainder) / count;

    let mut shares = vec![fee_per_request; request_count];
    shares[request_count - 1] += remainder;
    shares
}

/// Constructs an unsigned redemption Bitcoin transaction: one input spending
/// the wallet main UTXO, one output per redemption request, and an optional
/// change output back to the wallet placed according to the requested shape.
///
/// Fee shares applied to specific requests are not validated against system
/// limits here; proposal validation happens upstream on the host chain.
pub fn assemble_redemption_transaction(
    wallet_public_key: &PublicKey,
    main_utxo: &UnspentTransactionOutput,
    requests: &[RedemptionRequest],
    total_fee: u64,
    shape: RedemptionTransactionShape,
) -> Result<UnsignedBitcoinTransaction> {
    if requests.is_empty() {
        return Err(BridgeError::ProposalInvalid("at least one redemption request is required".to_string()));
    }

    let fee_shares = distribute_redemption_fee(total_fee, requests.len());

    let mut total_redemption_outputs_value: u64 = 0;
    let mut outputs = Vec::with_capacity(requests.len() + 1);

    for (request, fee_share) in requests.iter().zip(&fee_shares) {
        // The redeemable amount is the requested amount minus the treasury
        // fee computed upon request creation; the output additionally incurs
        // this request's share of the transaction fee.
        let output_value = request
            .requested_amount
            .checked_sub(request.treasury_fee)
            .and_then(|redeemable| redeemable.checked_sub(*fee_share))
            .ok_or_else(|| {
                BridgeError::ProposalInvalid(format!(
                    "request of [{}] does not cover treasury fee and fee share",
                    request.redeemer,
                ))
            })?;

        total_redemption_outputs_value += output_value;
        outputs.push(TxOut {
            value: Amount::from_sat(output_value),
            script_pubkey: request.redeemer_output_script.clone(),
        });
    }

    // fee = input_value - (redemption_outputs_value + change_value), hence
    // change_value = input_value - redemption_outputs_value - fee.
    let change_value = main_utxo
        .value
        .checked_sub(total_redemption_outputs_value)
        .and_then(|rest| rest.checked_sub(total_fee))
        .ok_or_else(|| {
            BridgeError::ProposalInvalid("main UTXO does not cover redemption outputs and fee".to_string())
        })?;

    if change_value > 0 {
        let change_output =
            TxOut { value: Amount::from_sat(change_value), script_pubkey: wallet_p2wpkh_script(wallet_public_key) };
        match shape {
            RedemptionTransactionShape::ChangeFirst => outputs.insert(0, change_output),
            RedemptionTransactionShape::ChangeLast => outputs.push(change_output),
        }
    }

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
