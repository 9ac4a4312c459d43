//! End-to-end DKG publication over the in-process chain and network: the
//! eligibility queue, the submission race, and member-fate reconciliation.

use crate::fixtures::{fresh_public_key, wait_until, NodeHarness, StubDkgProtocol};
use std::sync::Arc;
use std::time::Duration;
use tideway::domain::group::GroupParameters;
use tideway::domain::wallet::wallet_id_of;
use tideway::foundation::OperatorAddress;
use tideway::infrastructure::chain::OperatorSigner;
use tideway::infrastructure::chain::Signing;

fn small_group() -> GroupParameters {
    GroupParameters { group_size: 3, group_quorum: 3, honest_threshold: 2 }
}

#[tokio::test]
async fn operator_controlling_all_slots_publishes_exactly_one_result() {
    let wallet_key = fresh_public_key();
    let protocol = Arc::new(StubDkgProtocol::new(wallet_key.serialize().to_vec()));
    let harness = NodeHarness::start(small_group(), protocol).await;

    let operator = harness.chain.operator_address();
    harness.chain.set_group_selection_result(tideway::domain::group::GroupSelectionResult {
        operators_ids: vec![1, 1, 1],
        operators_addresses: vec![operator.clone(), operator.clone(), operator],
    });

    harness.wait_for_pre_params(3).await;
    harness.chain.set_current_block(100);
    harness.chain.start_dkg([7; 32]);

    // Keep the chain ticking until one member wins the submission race.
    let chain = harness.chain.clone();
    let submitted = harness.advance_blocks_until(400, move || !chain.submitted_dkg_results().is_empty()).await;
    assert!(submitted, "a DKG result must land on-chain");

    let registry = harness.node.wallet_registry();
    let wallet_id = wallet_id_of(&wallet_key);
    wait_until(Duration::from_secs(5), || registry.get_signer(&wallet_id).is_some()).await;

    // First on-chain submission wins; everyone else abandons cleanly.
    let results = harness.chain.submitted_dkg_results();
    assert_eq!(results.len(), 1, "exactly one canonical result may be submitted");
    assert_eq!(results[0].group_public_key, wallet_key.serialize().to_vec());
    assert_eq!(results[0].signatures.len(), 3);

    let signer = registry.get_signer(&wallet_id).expect("signer registered");
    assert_eq!(signer.signing_group_operators.len(), 3);

    harness.stop();
}

#[tokio::test]
async fn member_does_not_submit_before_its_eligibility_block() {
    let wallet_key = fresh_public_key();
    let protocol = Arc::new(StubDkgProtocol::new(wallet_key.serialize().to_vec()));
    // Quorum of one: the member's own signature suffices, so the only gate
    // before submission is the eligibility queue.
    let params = GroupParameters { group_size: 3, group_quorum: 1, honest_threshold: 1 };
    let harness = NodeHarness::start(params, protocol).await;

    let peer_one = OperatorSigner::generate();
    let peer_two = OperatorSigner::generate();
    harness.chain.register_operator(&peer_one.public_key());
    harness.chain.register_operator(&peer_two.public_key());

    // The local operator holds only the third slot.
    harness.chain.set_group_selection_result(tideway::domain::group::GroupSelectionResult {
        operators_ids: vec![2, 3, 1],
        operators_addresses: vec![peer_one.address(), peer_two.address(), harness.chain.operator_address()],
    });

    harness.wait_for_pre_params(1).await;
    harness.chain.set_current_block(100);
    harness.chain.start_dkg([8; 32]);

    // publication start = 110, block step = 6: member 3 becomes eligible at
    // block 110 + 2 * 6 = 122 and may not submit a single block earlier.
    for block in 101..122 {
        harness.chain.set_current_block(block);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            harness.chain.submitted_dkg_results().is_empty(),
            "no submission may happen before block 122, observed one at block {}",
            block,
        );
    }

    harness.chain.set_current_block(122);
    let chain = harness.chain.clone();
    wait_until(Duration::from_secs(5), move || !chain.submitted_dkg_results().is_empty()).await;

    let results = harness.chain.submitted_dkg_results();
    assert_eq!(results[0].submitter_member_index, 3);

    harness.stop();
}

/// Drives a member into publication failure (unreachable quorum) and
/// reconciliation against the result another member submitted. The local
/// operator holds slot 2 of a 4-member group; the peers never answer.
async fn reconciliation_harness(
    wallet_key: secp256k1::PublicKey,
) -> (NodeHarness, Vec<OperatorAddress>) {
    let protocol = Arc::new(StubDkgProtocol::new(wallet_key.serialize().to_vec()));
    let params = GroupParameters { group_size: 4, group_quorum: 3, honest_threshold: 3 };
    let harness = NodeHarness::start(params, protocol).await;

    let peers: Vec<OperatorSigner> = (0..3).map(|_| OperatorSigner::generate()).collect();
    for peer in &peers {
        harness.chain.register_operator(&peer.public_key());
    }

    let addresses = vec![
        peers[0].address(),
        harness.chain.operator_address(),
        peers[1].address(),
        peers[2].address(),
    ];
    harness.chain.set_group_selection_result(tideway::domain::group::GroupSelectionResult {
        operators_ids: vec![2, 1, 3, 4],
        operators_addresses: addresses.clone(),
    });

    harness.wait_for_pre_params(1).await;
    harness.chain.set_current_block(100);
    harness.chain.start_dkg([9; 32]);

    // Let the signature collection window (blocks 110..115) pass so the
    // member falls into reconciliation, but stay below the publication
    // timeout block 139.
    for block in 101..=116 {
        harness.chain.set_current_block(block);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    (harness, addresses)
}

#[tokio::test]
async fn member_stays_when_accepted_result_matches_and_it_behaved() {
    let wallet_key = fresh_public_key();
    let (harness, addresses) = reconciliation_harness(wallet_key).await;

    // Member 4 misbehaved according to the accepted result; the local
    // member (slot 2) is fine and must register a signer over the three
    // operating members.
    harness.chain.notify_dkg_result_submitted(wallet_key.serialize().to_vec(), vec![4]);

    let registry = harness.node.wallet_registry();
    let wallet_id = wallet_id_of(&wallet_key);
    wait_until(Duration::from_secs(5), || registry.get_signer(&wallet_id).is_some()).await;

    let signer = registry.get_signer(&wallet_id).expect("signer registered");
    assert_eq!(signer.member_index, 2);
    assert_eq!(signer.signing_group_operators, vec![addresses[0].clone(), addresses[1].clone(), addresses[2].clone()]);

    harness.stop();
}

#[tokio::test]
async fn member_marked_misbehaved_does_not_register() {
    let wallet_key = fresh_public_key();
    let (harness, _addresses) = reconciliation_harness(wallet_key).await;

    // The accepted result names the local member (slot 2) as misbehaving.
    harness.chain.notify_dkg_result_submitted(wallet_key.serialize().to_vec(), vec![2]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let registry = harness.node.wallet_registry();
    assert!(registry.get_signer(&wallet_id_of(&wallet_key)).is_none(), "a misbehaving member cannot stay");

    harness.stop();
}

#[tokio::test]
async fn member_abandons_on_group_public_key_fork() {
    let wallet_key = fresh_public_key();
    let (harness, _addresses) = reconciliation_harness(wallet_key).await;

    // The accepted result carries a different group public key.
    let forked_key = fresh_public_key();
    harness.chain.notify_dkg_result_submitted(forked_key.serialize().to_vec(), vec![]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let registry = harness.node.wallet_registry();
    assert!(registry.get_signer(&wallet_id_of(&wallet_key)).is_none());
    assert!(registry.get_signer(&wallet_id_of(&forked_key)).is_none());

    harness.stop();
}
