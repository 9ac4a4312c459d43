//! SPV maintainer over the in-process facades: sweep discovery,
//! classification, proof submission, and idempotence of proven sweeps.

use crate::fixtures::{build_transaction, fresh_public_key, fund_wallet};
use bitcoin::hashes::Hash;
use bitcoin::{Amount, TxOut, Txid};
use std::sync::Arc;
use tideway::application::spv::SpvMaintainer;
use tideway::domain::group::GroupParameters;
use tideway::domain::wallet::{wallet_id_of, wallet_p2wpkh_script, DepositChainData, DepositKey, DepositSweepProposal};
use tideway::infrastructure::bitcoin::LocalBitcoin;
use tideway::infrastructure::chain::{LocalChain, OperatorSigner};
use tideway::infrastructure::config::SpvConfig;

fn wallet_output(wallet_key: &secp256k1::PublicKey, value: u64) -> TxOut {
    TxOut { value: Amount::from_sat(value), script_pubkey: wallet_p2wpkh_script(wallet_key) }
}

#[tokio::test]
async fn maintainer_proves_only_unproven_deposit_sweeps() {
    let operator = Arc::new(OperatorSigner::generate());
    let chain = Arc::new(LocalChain::new(operator.clone(), GroupParameters::default()));
    let btc = Arc::new(LocalBitcoin::new());
    chain.set_current_block(50_000);

    let wallet_key = fresh_public_key();
    let wallet_id = wallet_id_of(&wallet_key);

    // Two revealed, unswept deposits.
    let deposit_one = (Txid::from_byte_array([0xD1; 32]), 0u32);
    let deposit_two = (Txid::from_byte_array([0xD2; 32]), 1u32);
    chain.set_deposit(deposit_one.0, deposit_one.1, DepositChainData { revealed_at: 1_700_000_000, swept_at: 0 });
    chain.set_deposit(deposit_two.0, deposit_two.1, DepositChainData { revealed_at: 1_700_000_100, swept_at: 0 });

    // The first candidate has one output and two unswept deposit inputs,
    // an unproven sweep. The second has two outputs and is not a sweep.
    let sweep = build_transaction(&[deposit_one, deposit_two], vec![wallet_output(&wallet_key, 300_000)]);
    let not_a_sweep = build_transaction(
        &[(Txid::from_byte_array([0xD3; 32]), 0)],
        vec![wallet_output(&wallet_key, 100_000), wallet_output(&wallet_key, 50_000)],
    );
    let sweep_txid = sweep.compute_txid();

    btc.mine_block(vec![sweep.clone(), not_a_sweep]);
    btc.mine_empty_blocks(5);

    chain.submit_deposit_sweep_proposal(
        wallet_id,
        DepositSweepProposal {
            deposits_keys: vec![
                DepositKey { funding_tx_hash: deposit_one.0, funding_output_index: deposit_one.1 },
                DepositKey { funding_tx_hash: deposit_two.0, funding_output_index: deposit_two.1 },
            ],
            sweep_tx_fee: 2_000,
        },
        chain.operator_address(),
    );

    let maintainer = SpvMaintainer::new(chain.clone(), btc.clone(), SpvConfig::default());
    maintainer.prove_deposit_sweep_transactions().await.expect("proving round");

    let proofs = chain.submitted_sweep_proofs();
    assert_eq!(proofs.len(), 1, "only the sweep-shaped transaction is proven");
    assert_eq!(proofs[0].0, sweep_txid);

    // The proof marked the deposits as swept; the next round finds nothing.
    maintainer.prove_deposit_sweep_transactions().await.expect("second proving round");
    assert_eq!(chain.submitted_sweep_proofs().len(), 1, "a proven sweep is never proven again");
}

#[tokio::test]
async fn transaction_without_deposit_inputs_is_never_proven() {
    let operator = Arc::new(OperatorSigner::generate());
    let chain = Arc::new(LocalChain::new(operator.clone(), GroupParameters::default()));
    let btc = Arc::new(LocalBitcoin::new());
    chain.set_current_block(50_000);

    let wallet_key = fresh_public_key();
    let (wallet_id, main_utxo) = fund_wallet(&chain, &btc, &wallet_key, 500_000);

    // A single-output transaction spending only the wallet's main UTXO,
    // e.g. a redemption change; it has the sweep shape but no deposit
    // inputs.
    let candidate = build_transaction(
        &[(main_utxo.outpoint.txid, main_utxo.outpoint.vout)],
        vec![wallet_output(&wallet_key, 499_000)],
    );
    btc.mine_block(vec![candidate]);
    btc.mine_empty_blocks(5);

    chain.submit_deposit_sweep_proposal(
        wallet_id,
        DepositSweepProposal {
            deposits_keys: vec![DepositKey {
                funding_tx_hash: Txid::from_byte_array([0xD9; 32]),
                funding_output_index: 0,
            }],
            sweep_tx_fee: 1_000,
        },
        chain.operator_address(),
    );

    let maintainer = SpvMaintainer::new(chain.clone(), btc.clone(), SpvConfig::default());
    maintainer.prove_deposit_sweep_transactions().await.expect("proving round");

    assert!(chain.submitted_sweep_proofs().is_empty(), "zero deposit inputs never classify as a sweep");
}

#[tokio::test]
async fn one_bad_transaction_does_not_abort_the_batch() {
    let operator = Arc::new(OperatorSigner::generate());
    let chain = Arc::new(LocalChain::new(operator.clone(), GroupParameters::default()));
    let btc = Arc::new(LocalBitcoin::new());
    chain.set_current_block(50_000);
    chain.set_tx_proof_difficulty_factor(6);

    let wallet_key = fresh_public_key();
    let wallet_id = wallet_id_of(&wallet_key);

    let deposit_shallow = (Txid::from_byte_array([0xE1; 32]), 0u32);
    let deposit_deep = (Txid::from_byte_array([0xE2; 32]), 0u32);
    chain.set_deposit(deposit_shallow.0, deposit_shallow.1, DepositChainData { revealed_at: 1, swept_at: 0 });
    chain.set_deposit(deposit_deep.0, deposit_deep.1, DepositChainData { revealed_at: 2, swept_at: 0 });

    // The deep sweep is buried under enough confirmations; the shallow one
    // is too fresh for a proof and must merely be skipped.
    let deep_sweep = build_transaction(&[deposit_deep], vec![wallet_output(&wallet_key, 100_000)]);
    let deep_txid = deep_sweep.compute_txid();
    btc.mine_block(vec![deep_sweep]);
    btc.mine_empty_blocks(5);

    let shallow_sweep = build_transaction(&[deposit_shallow], vec![wallet_output(&wallet_key, 90_000)]);
    btc.mine_block(vec![shallow_sweep]);

    chain.submit_deposit_sweep_proposal(
        wallet_id,
        DepositSweepProposal { deposits_keys: vec![], sweep_tx_fee: 1_000 },
        chain.operator_address(),
    );

    let maintainer = SpvMaintainer::new(chain.clone(), btc.clone(), SpvConfig::default());
    maintainer.prove_deposit_sweep_transactions().await.expect("round tolerates partial failure");

    let proofs = chain.submitted_sweep_proofs();
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].0, deep_txid);
}
