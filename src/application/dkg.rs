//! Driving a DKG execution to exactly one canonical on-chain result:
//! result-signature exchange over the broadcast channel, the block-timed
//! eligibility queue for submission, and the race with other members.

use crate::domain::dkg::{
    eligible_submission_block, publication_timeout_block, DkgResult, EcdsaPreParams, SignedDkgResult,
};
use crate::domain::group::{GroupParameters, GroupSelectionResult, MembershipValidator};
use crate::foundation::{BridgeError, Hash32, MemberIndex, Result, PRE_PUBLICATION_BLOCKS};
use crate::infrastructure::chain::{Chain, DkgResultSubmittedEvent, DkgState, EventSubscription};
use crate::infrastructure::network::{BroadcastChannel, MessageHandler, ProtocolMessage, ReceivedMessage};
use async_trait::async_trait;
use log::{debug, info, warn};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, watch};

pub const RESULT_SIGNATURE_MESSAGE_TYPE: &str = "tideway/dkg_result_signature";

/// Broadcast by every member during the publication phase: the member's
/// signature supporting its view of the DKG result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DkgResultSignatureMessage {
    pub sender_index: MemberIndex,
    pub result_hash: Hash32,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl ProtocolMessage for DkgResultSignatureMessage {
    fn message_type(&self) -> &'static str {
        RESULT_SIGNATURE_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Installs the decode functions for all DKG protocol messages on a channel.
pub fn register_dkg_unmarshalers(channel: &dyn BroadcastChannel) {
    channel.register_unmarshaler(
        RESULT_SIGNATURE_MESSAGE_TYPE,
        Box::new(|payload| {
            Ok(Box::new(bincode::deserialize::<DkgResultSignatureMessage>(payload)?) as Box<dyn ProtocolMessage>)
        }),
    );
}

/// Execution backend of the DKG protocol itself. The protocol math is
/// outside this crate; the backend receives the broadcast channel and the
/// pooled pre-computed parameters, and yields the result together with the
/// block at which the execution ended.
#[async_trait]
pub trait DkgProtocol: Send + Sync {
    async fn execute(
        &self,
        seed: &Hash32,
        start_block: u64,
        member_index: MemberIndex,
        group_parameters: &GroupParameters,
        pre_params: EcdsaPreParams,
        channel: Arc<dyn BroadcastChannel>,
    ) -> Result<DkgExecutionOutcome>;

    /// Produces one set of pre-computed parameters, or `None` when the
    /// cancellation signal fires before completion.
    async fn generate_pre_params(&self, cancel: watch::Receiver<bool>) -> Option<EcdsaPreParams>;
}

pub struct DkgExecutionOutcome {
    pub result: DkgResult,
    pub execution_end_block: u64,
}

/// Signs the local DKG result and verifies signatures received from peers.
pub struct DkgResultSigner {
    chain: Arc<dyn Chain>,
    dkg_start_block: u64,
}

impl DkgResultSigner {
    pub fn new(chain: Arc<dyn Chain>, dkg_start_block: u64) -> Self {
        Self { chain, dkg_start_block }
    }

    pub fn sign_result(&self, result: &DkgResult) -> Result<SignedDkgResult> {
        let result_hash = self.chain.calculate_dkg_result_signature_hash(
            &result.group_public_key,
            &result.group.misbehaved_member_indexes(),
            self.dkg_start_block,
        )?;

        let signing = self.chain.signing();
        let signature = signing
            .sign(&result_hash)
            .map_err(|err| BridgeError::SigningFailed(format!("dkg result hash signing failed: {}", err)))?;

        Ok(SignedDkgResult { public_key: signing.public_key().serialize().to_vec(), signature, result_hash })
    }

    pub fn verify_signature(&self, signed: &SignedDkgResult) -> Result<bool> {
        let public_key = match PublicKey::from_slice(&signed.public_key) {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };
        self.chain.signing().verify_with_public_key(&signed.result_hash, &signed.signature, &public_key)
    }
}

/// Submits the DKG result to the chain, honoring the eligibility queue and
/// giving up when another member wins the race.
pub struct DkgResultSubmitter {
    chain: Arc<dyn Chain>,
    group_parameters: GroupParameters,
    group_selection_result: GroupSelectionResult,
}

impl DkgResultSubmitter {
    pub fn new(chain: Arc<dyn Chain>, group_parameters: GroupParameters, group_selection_result: GroupSelectionResult) -> Self {
        Self { chain, group_parameters, group_selection_result }
    }

    /// Submits the result with the supporting signatures. Checks the
    /// signature quorum, whether the result was already submitted, and waits
    /// until the member becomes eligible for submission. Returns `Ok` both
    /// after an own submission and after cleanly losing the race.
    pub async fn submit_result(
        &self,
        member_index: MemberIndex,
        result: &DkgResult,
        signatures: &BTreeMap<MemberIndex, Vec<u8>>,
        publication_start_block: u64,
    ) -> Result<()> {
        if signatures.len() < self.group_parameters.group_quorum as usize {
            return Err(BridgeError::SignatureQuorumNotMet {
                collected: signatures.len(),
                quorum: self.group_parameters.group_quorum as usize,
            });
        }

        let mut submission_events = self.chain.on_dkg_result_submitted();

        if self.chain.get_dkg_state().await? != DkgState::AwaitingResult {
            // Someone ahead of us in the queue submitted the result.
            info!("[member:{}] DKG is no longer awaiting the result; aborting DKG result submission", member_index);
            return Ok(());
        }

        let block_step = self.chain.dkg_parameters().await?.result_publication_block_step;
        let eligible_block = eligible_submission_block(publication_start_block, member_index, block_step);
        info!("[member:{}] waiting for block [{}] to submit", member_index, eligible_block);

        let block_counter = self.chain.block_counter();
        let eligibility = block_counter.wait_for_block(eligible_block);
        tokio::pin!(eligibility);

        tokio::select! {
            reached = &mut eligibility => {
                reached?;
            }
            event = submission_events.recv() => {
                if let Some(event) = event {
                    info!(
                        "[member:{}] leaving; DKG result submitted by other member at block [{}]",
                        member_index, event.block_number,
                    );
                    return Ok(());
                }
            }
        }

        // The queue wait can take a while; re-read the chain state right
        // before submitting.
        if self.chain.get_dkg_state().await? != DkgState::AwaitingResult {
            info!("[member:{}] DKG is no longer awaiting the result; aborting DKG result submission", member_index);
            return Ok(());
        }

        let chain_result = self
            .chain
            .assemble_dkg_result(
                member_index,
                &result.group_public_key,
                &result.group.operating_member_indexes(),
                &result.group.misbehaved_member_indexes(),
                signatures,
                &self.group_selection_result,
            )
            .await?;

        if !self.chain.is_dkg_result_valid(&chain_result).await? {
            return Err(BridgeError::InvalidDkgResult("result rejected by pre-submission validation".to_string()));
        }

        info!(
            "[member:{}] submitting DKG result with public key [0x{}] and [{}] supporting member signatures",
            member_index,
            hex::encode(&result.group_public_key),
            signatures.len(),
        );
        self.chain.submit_dkg_result(&chain_result).await
    }
}

/// Runs the publication phase for one controlled member index: sign the
/// result, exchange signatures with peers over the broadcast channel, and
/// drive the on-chain submission.
pub struct DkgPublisher {
    chain: Arc<dyn Chain>,
    group_parameters: GroupParameters,
    group_selection_result: GroupSelectionResult,
    channel: Arc<dyn BroadcastChannel>,
    membership: Arc<MembershipValidator>,
}

impl DkgPublisher {
    pub fn new(
        chain: Arc<dyn Chain>,
        group_parameters: GroupParameters,
        group_selection_result: GroupSelectionResult,
        channel: Arc<dyn BroadcastChannel>,
        membership: Arc<MembershipValidator>,
    ) -> Self {
        Self { chain, group_parameters, group_selection_result, channel, membership }
    }

    pub async fn publish_result(
        &self,
        member_index: MemberIndex,
        result: &DkgResult,
        publication_start_block: u64,
        dkg_start_block: u64,
    ) -> Result<()> {
        let signer = DkgResultSigner::new(self.chain.clone(), dkg_start_block);
        let signed = signer.sign_result(result)?;

        let signatures =
            self.collect_signatures(member_index, &signer, &signed, publication_start_block).await?;

        let submitter =
            DkgResultSubmitter::new(self.chain.clone(), self.group_parameters, self.group_selection_result.clone());
        submitter.submit_result(member_index, result, &signatures, publication_start_block).await
    }

    /// Broadcasts the own signature and collects peers' signatures over the
    /// result hash until the group quorum is reached or the collection
    /// window of `PRE_PUBLICATION_BLOCKS` ends. Only signatures that verify
    /// under the advertised key, match the local hash bit-exactly, and come
    /// from a selected operator are retained, at most one per member index.
    async fn collect_signatures(
        &self,
        member_index: MemberIndex,
        signer: &DkgResultSigner,
        signed: &SignedDkgResult,
        publication_start_block: u64,
    ) -> Result<BTreeMap<MemberIndex, Vec<u8>>> {
        let (forward, mut received) = mpsc::unbounded_channel::<(PublicKey, DkgResultSignatureMessage)>();
        self.channel.recv(MessageHandler {
            message_type: RESULT_SIGNATURE_MESSAGE_TYPE,
            handler: Arc::new(move |message: ReceivedMessage| {
                if let Some(payload) = message.payload_as::<DkgResultSignatureMessage>() {
                    let _ = forward.send((message.sender_public_key, payload.clone()));
                }
            }),
        });

        self.channel
            .send(&DkgResultSignatureMessage {
                sender_index: member_index,
                result_hash: signed.result_hash,
                signature: signed.signature.clone(),
                public_key: signed.public_key.clone(),
            })
            .await?;

        let mut signatures: BTreeMap<MemberIndex, Vec<u8>> = BTreeMap::new();
        signatures.insert(member_index, signed.signature.clone());

        let quorum = self.group_parameters.group_quorum as usize;
        let block_counter = self.chain.block_counter();
        let window_end = block_counter.wait_for_block(publication_start_block + PRE_PUBLICATION_BLOCKS);
        tokio::pin!(window_end);

        while signatures.len() < quorum {
            tokio::select! {
                _ = &mut window_end => break,
                message = received.recv() => {
                    let Some((sender_public_key, message)) = message else { break };
                    if let Some((index, signature)) =
                        self.accept_signature(member_index, signer, signed, &sender_public_key, message, &signatures)
                    {
                        signatures.insert(index, signature);
                        debug!(
                            "[member:{}] accepted result signature of member [{}], [{}] of [{}] collected",
                            member_index, index, signatures.len(), quorum,
                        );
                    }
                }
            }
        }

        // The handler stays registered: sibling member tasks share this
        // channel and their handlers must keep firing. Dropping the local
        // queue receiver is enough to stop deliveries to this collector.
        Ok(signatures)
    }

    fn accept_signature(
        &self,
        own_index: MemberIndex,
        signer: &DkgResultSigner,
        own_signed: &SignedDkgResult,
        sender_public_key: &PublicKey,
        message: DkgResultSignatureMessage,
        collected: &BTreeMap<MemberIndex, Vec<u8>>,
    ) -> Option<(MemberIndex, Vec<u8>)> {
        let index = message.sender_index;
        if index == own_index || index < 1 || index > self.group_parameters.group_size {
            return None;
        }
        if collected.contains_key(&index) {
            return None;
        }

        // The sender must occupy the member slot it claims.
        let claimed_operator = self.group_selection_result.operators_addresses.get(index as usize - 1)?;
        let sender_address = self.chain.signing().public_key_to_address(sender_public_key);
        if *claimed_operator != sender_address || !self.membership.is_in_group(sender_public_key) {
            debug!("[member:{}] dropping result signature of an impostor for slot [{}]", own_index, index);
            return None;
        }

        if message.public_key != sender_public_key.serialize() {
            return None;
        }

        if !bool::from(message.result_hash.ct_eq(&own_signed.result_hash)) {
            debug!("[member:{}] dropping result signature over a different result hash", own_index);
            return None;
        }

        let verified = signer
            .verify_signature(&SignedDkgResult {
                public_key: message.public_key,
                signature: message.signature.clone(),
                result_hash: message.result_hash,
            })
            .unwrap_or(false);
        if !verified {
            warn!("[member:{}] dropping result signature that does not verify for slot [{}]", own_index, index);
            return None;
        }

        Some((index, message.signature))
    }
}

/// Waits for the DKG result submission event, timing out at the block by
/// which every member had an eligibility window and none submitted.
pub async fn wait_for_dkg_result_event(
    chain: &dyn Chain,
    mut subscription: EventSubscription<DkgResultSubmittedEvent>,
    publication_start_block: u64,
    group_parameters: &GroupParameters,
) -> Result<DkgResultSubmittedEvent> {
    let block_step = chain.dkg_parameters().await?.result_publication_block_step;
    let timeout_block = publication_timeout_block(publication_start_block, group_parameters, block_step);

    let block_counter = chain.block_counter();
    let timeout = block_counter.wait_for_block(timeout_block);
    tokio::pin!(timeout);

    tokio::select! {
        event = subscription.recv() => event.ok_or(BridgeError::PublicationTimeout),
        _ = &mut timeout => Err(BridgeError::PublicationTimeout),
    }
}
