//! Moving funds action: commitment submission and verification, target
//! split, and the fatal consistency checks.

use crate::fixtures::{fresh_public_key, fund_wallet, wallet_signer, StubSigningExecutor};
use std::sync::Arc;
use std::time::Duration;
use tideway::application::actions::MovingFundsAction;
use tideway::domain::group::GroupParameters;
use tideway::domain::wallet::{MovingFundsProposal, WalletChainData, WalletState};
use tideway::foundation::{BridgeError, WalletId};
use tideway::infrastructure::bitcoin::LocalBitcoin;
use tideway::infrastructure::chain::{
    main_utxo_hash, moving_funds_commitment_hash, LocalChain, OperatorSigner, Signing, WalletParameters,
};

struct Setup {
    operator: Arc<OperatorSigner>,
    chain: Arc<LocalChain>,
    btc: Arc<LocalBitcoin>,
    wallet_key: secp256k1::PublicKey,
    wallet_id: WalletId,
}

fn moving_funds_wallet(main_utxo_value: u64) -> Setup {
    let operator = Arc::new(OperatorSigner::generate());
    let chain = Arc::new(LocalChain::new(operator.clone(), GroupParameters::default()));
    let btc = Arc::new(LocalBitcoin::new());

    let wallet_key = fresh_public_key();
    let (wallet_id, utxo) = fund_wallet(&chain, &btc, &wallet_key, main_utxo_value);

    // The source wallet left the Live fleet.
    chain.set_wallet(
        wallet_id,
        WalletChainData {
            public_key: wallet_key,
            state: WalletState::MovingFunds,
            main_utxo_hash: main_utxo_hash(&utxo),
            pending_redemptions_value: 0,
            pending_moved_funds_sweep_requests_count: 0,
            moving_funds_target_wallets_commitment_hash: [0u8; 32],
        },
    );
    chain.set_live_wallets_count(5);

    Setup { operator, chain, btc, wallet_key, wallet_id }
}

fn targets() -> Vec<WalletId> {
    vec![WalletId::new([0xA1; 20]), WalletId::new([0xA2; 20])]
}

fn action(setup: &Setup, proposal: MovingFundsProposal) -> MovingFundsAction {
    MovingFundsAction::new(
        setup.chain.clone(),
        setup.btc.clone(),
        wallet_signer(&setup.operator, &setup.wallet_key, 1),
        Arc::new(StubSigningExecutor),
        proposal,
        100,
        100 + 650,
    )
    .with_broadcast_timing(Duration::from_millis(500), Duration::from_millis(10))
}

#[tokio::test]
async fn moving_funds_submits_commitment_and_splits_the_balance() {
    let setup = moving_funds_wallet(1_000_001);
    let proposal = MovingFundsProposal { target_wallets: targets(), moving_funds_tx_fee: 1_000 };

    let transaction = action(&setup, proposal).execute().await.expect("moving funds executed");

    assert_eq!(setup.chain.moving_funds_commitment_count(), 1, "commitment submitted before signing");

    let values: Vec<u64> = transaction.output.iter().map(|output| output.value.to_sat()).collect();
    assert_eq!(values, vec![499_500, 499_501], "balance minus fee, remainder on the last target");
    assert!(setup.btc.broadcast_log().contains(&transaction.compute_txid()));

    let wallet = setup.chain.wallet_data(&setup.wallet_id).expect("wallet known");
    assert_eq!(wallet.moving_funds_target_wallets_commitment_hash, moving_funds_commitment_hash(&targets()));
}

#[tokio::test]
async fn mismatched_commitment_hash_is_fatal() {
    let setup = moving_funds_wallet(1_000_000);

    // A commitment over a different target set is already on-chain.
    let other_targets = vec![WalletId::new([0xB1; 20])];
    let mut wallet = setup.chain.wallet_data(&setup.wallet_id).expect("wallet known");
    wallet.moving_funds_target_wallets_commitment_hash = moving_funds_commitment_hash(&other_targets);
    setup.chain.set_wallet(setup.wallet_id, wallet);

    let proposal = MovingFundsProposal { target_wallets: targets(), moving_funds_tx_fee: 1_000 };
    let err = action(&setup, proposal).execute().await.expect_err("commitment mismatch must abort");
    assert!(matches!(err, BridgeError::WrongCommitmentHash));
}

#[tokio::test]
async fn zero_max_btc_transfer_is_fatal() {
    let setup = moving_funds_wallet(1_000_000);
    setup
        .chain
        .set_wallet_parameters(WalletParameters { wallet_max_btc_transfer: 0, ..WalletParameters::default() });

    let proposal = MovingFundsProposal { target_wallets: targets(), moving_funds_tx_fee: 1_000 };
    let err = action(&setup, proposal).execute().await.expect_err("zero max transfer must abort");
    assert!(matches!(err, BridgeError::MaxBtcTransferZero));
}

#[tokio::test]
async fn foreign_operator_cannot_submit_the_commitment() {
    let setup = moving_funds_wallet(1_000_000);

    // The signer's operator set does not contain the executing operator.
    let foreign = OperatorSigner::generate();
    setup.chain.register_operator(&foreign.public_key());
    let mut signer = wallet_signer(&foreign, &setup.wallet_key, 1);
    signer.signing_group_operators = vec![foreign.address()];

    let proposal = MovingFundsProposal { target_wallets: targets(), moving_funds_tx_fee: 1_000 };
    let action = MovingFundsAction::new(
        setup.chain.clone(),
        setup.btc.clone(),
        signer,
        Arc::new(StubSigningExecutor),
        proposal,
        100,
        750,
    );

    let err = action.execute().await.expect_err("executing operator must be a wallet operator");
    assert!(matches!(err, BridgeError::NoExecutingOperator));
}

#[tokio::test]
async fn live_wallet_cannot_move_funds() {
    let setup = moving_funds_wallet(1_000_000);
    let mut wallet = setup.chain.wallet_data(&setup.wallet_id).expect("wallet known");
    wallet.state = WalletState::Live;
    setup.chain.set_wallet(setup.wallet_id, wallet);

    let proposal = MovingFundsProposal { target_wallets: targets(), moving_funds_tx_fee: 1_000 };
    let err = action(&setup, proposal).execute().await.expect_err("state check must abort");
    assert!(matches!(err, BridgeError::ProposalInvalid(_)));
}
