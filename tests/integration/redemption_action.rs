//! Redemption action over the in-process chain and Bitcoin facades: fee
//! distribution, output values, change placement, and broadcast.

use crate::fixtures::{fresh_public_key, fund_wallet, wallet_signer, StubSigningExecutor};
use bitcoin::hashes::Hash;
use bitcoin::{ScriptBuf, WPubkeyHash};
use std::sync::Arc;
use std::time::Duration;
use tideway::application::actions::RedemptionAction;
use tideway::domain::group::GroupParameters;
use tideway::domain::redemption::RedemptionRequest;
use tideway::domain::wallet::{wallet_p2wpkh_script, RedemptionProposal, WalletChainData, WalletState};
use tideway::foundation::{BridgeError, ChainAddress};
use tideway::infrastructure::bitcoin::{BitcoinChain, LocalBitcoin};
use tideway::infrastructure::chain::{LocalChain, OperatorSigner};

fn redeemer_script(marker: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([marker; 20]))
}

fn pending_request(script: ScriptBuf, requested_amount: u64, treasury_fee: u64) -> RedemptionRequest {
    RedemptionRequest {
        redeemer: ChainAddress::new("0x00112233"),
        redeemer_output_script: script,
        requested_amount,
        treasury_fee,
        tx_max_fee: 10_000,
        requested_at: 1_700_000_000,
    }
}

#[tokio::test]
async fn redemption_pays_requests_and_places_change_first() {
    let operator = Arc::new(OperatorSigner::generate());
    let chain = Arc::new(LocalChain::new(operator.clone(), GroupParameters::default()));
    let btc = Arc::new(LocalBitcoin::new());

    let wallet_key = fresh_public_key();
    let (wallet_id, _main_utxo) = fund_wallet(&chain, &btc, &wallet_key, 10_000_000);

    let first_script = redeemer_script(0x21);
    let second_script = redeemer_script(0x22);
    chain.set_pending_redemption_request(wallet_id, pending_request(first_script.clone(), 1_000_000, 1_000));
    chain.set_pending_redemption_request(wallet_id, pending_request(second_script.clone(), 2_000_000, 2_000));

    let proposal = RedemptionProposal {
        redeemers_output_scripts: vec![first_script.clone(), second_script.clone()],
        redemption_tx_fee: 1_001,
    };

    let action = RedemptionAction::new(
        chain.clone(),
        btc.clone(),
        wallet_signer(&operator, &wallet_key, 1),
        Arc::new(StubSigningExecutor),
        proposal,
        100,
        100 + 600,
    )
    .expect("action")
    .with_broadcast_timing(Duration::from_millis(500), Duration::from_millis(10));

    let transaction = action.execute().await.expect("redemption executed");

    // Fee 1001 over two requests: shares 500 and 501.
    let outputs = &transaction.output;
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[0].script_pubkey, wallet_p2wpkh_script(&wallet_key), "change comes first");
    assert_eq!(outputs[1].script_pubkey, first_script);
    assert_eq!(outputs[1].value.to_sat(), 1_000_000 - 1_000 - 500);
    assert_eq!(outputs[2].script_pubkey, second_script);
    assert_eq!(outputs[2].value.to_sat(), 2_000_000 - 2_000 - 501);
    assert_eq!(
        outputs[0].value.to_sat(),
        10_000_000 - (outputs[1].value.to_sat() + outputs[2].value.to_sat()) - 1_001,
    );

    // The transaction went out and is known to the Bitcoin chain.
    let txid = transaction.compute_txid();
    assert!(btc.broadcast_log().contains(&txid));
    assert!(btc.get_transaction(&txid).await.is_ok());
}

#[tokio::test]
async fn proposal_with_unknown_request_is_rejected() {
    let operator = Arc::new(OperatorSigner::generate());
    let chain = Arc::new(LocalChain::new(operator.clone(), GroupParameters::default()));
    let btc = Arc::new(LocalBitcoin::new());

    let wallet_key = fresh_public_key();
    let (wallet_id, _) = fund_wallet(&chain, &btc, &wallet_key, 10_000_000);

    let known_script = redeemer_script(0x31);
    chain.set_pending_redemption_request(wallet_id, pending_request(known_script.clone(), 1_000_000, 1_000));

    let proposal = RedemptionProposal {
        redeemers_output_scripts: vec![known_script, redeemer_script(0x32)],
        redemption_tx_fee: 1_000,
    };

    let action = RedemptionAction::new(
        chain,
        btc,
        wallet_signer(&operator, &wallet_key, 1),
        Arc::new(StubSigningExecutor),
        proposal,
        100,
        700,
    )
    .expect("action");

    let err = action.execute().await.expect_err("proposal must fail");
    assert!(matches!(err, BridgeError::ProposalInvalid(_)));
}

#[tokio::test]
async fn stale_main_utxo_commitment_aborts_the_action() {
    let operator = Arc::new(OperatorSigner::generate());
    let chain = Arc::new(LocalChain::new(operator.clone(), GroupParameters::default()));
    let btc = Arc::new(LocalBitcoin::new());

    let wallet_key = fresh_public_key();
    let (wallet_id, _) = fund_wallet(&chain, &btc, &wallet_key, 10_000_000);

    // The host chain commits a main UTXO hash that matches none of the
    // wallet's Bitcoin outputs.
    chain.set_wallet(
        wallet_id,
        WalletChainData {
            public_key: wallet_key,
            state: WalletState::Live,
            main_utxo_hash: [0xEE; 32],
            pending_redemptions_value: 0,
            pending_moved_funds_sweep_requests_count: 0,
            moving_funds_target_wallets_commitment_hash: [0u8; 32],
        },
    );

    let script = redeemer_script(0x41);
    chain.set_pending_redemption_request(wallet_id, pending_request(script.clone(), 1_000_000, 1_000));

    let action = RedemptionAction::new(
        chain,
        btc,
        wallet_signer(&operator, &wallet_key, 1),
        Arc::new(StubSigningExecutor),
        RedemptionProposal { redeemers_output_scripts: vec![script], redemption_tx_fee: 1_000 },
        100,
        700,
    )
    .expect("action");

    let err = action.execute().await.expect_err("mismatched wallet state must abort");
    assert!(matches!(err, BridgeError::MainUtxoNotFound));
}
