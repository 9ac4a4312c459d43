//! Operator key handling: ECDSA signing and address derivation over
//! secp256k1. The network and the chain facade share this identity.

use crate::domain::group::operator_address_from_public_key;
use crate::foundation::{ChainAddress, Result};
use bitcoin::hashes::{sha256, Hash};
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

/// Chain-level signing capability bound to the operator key.
pub trait Signing: Send + Sync {
    fn public_key(&self) -> PublicKey;
    fn address(&self) -> ChainAddress;
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
    fn verify_with_public_key(&self, message: &[u8], signature: &[u8], public_key: &PublicKey) -> Result<bool>;
    fn public_key_to_address(&self, public_key: &PublicKey) -> ChainAddress;
}

/// Signer over the operator's secp256k1 key pair.
pub struct OperatorSigner {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
    public_key: PublicKey,
    address: ChainAddress,
}

impl OperatorSigner {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        let address = operator_address_from_public_key(&public_key);
        Self { secp, secret_key, public_key, address }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(SecretKey::from_slice(bytes)?))
    }

    /// Fresh random operator identity, for tests and local setups.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        Self::new(secret_key)
    }
}

impl Signing for OperatorSigner {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn address(&self) -> ChainAddress {
        self.address.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let digest = sha256::Hash::hash(message).to_byte_array();
        let signature = self.secp.sign_ecdsa(&Message::from_digest(digest), &self.secret_key);
        Ok(signature.serialize_compact().to_vec())
    }

    fn verify_with_public_key(&self, message: &[u8], signature: &[u8], public_key: &PublicKey) -> Result<bool> {
        verify_signature(message, signature, public_key)
    }

    fn public_key_to_address(&self, public_key: &PublicKey) -> ChainAddress {
        operator_address_from_public_key(public_key)
    }
}

/// Verifies a compact ECDSA signature over sha256 of the message.
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &PublicKey) -> Result<bool> {
    let digest = sha256::Hash::hash(message).to_byte_array();
    let signature = match Signature::from_compact(signature) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };
    Ok(secp256k1::Secp256k1::verification_only()
        .verify_ecdsa(&Message::from_digest(digest), &signature, public_key)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = OperatorSigner::generate();
        let message = b"dkg result hash";

        let signature = signer.sign(message).expect("signature");
        assert!(signer.verify_with_public_key(message, &signature, &signer.public_key()).expect("verification"));

        let other = OperatorSigner::generate();
        assert!(!signer.verify_with_public_key(message, &signature, &other.public_key()).expect("verification"));
        assert!(!signer.verify_with_public_key(b"other message", &signature, &signer.public_key()).expect("verification"));
    }

    #[test]
    fn malformed_signature_is_rejected_not_an_error() {
        let signer = OperatorSigner::generate();
        assert!(!signer.verify_with_public_key(b"message", &[0u8; 10], &signer.public_key()).expect("verification"));
    }

    #[test]
    fn address_is_stable_for_a_key() {
        let signer = OperatorSigner::generate();
        assert_eq!(signer.address(), signer.public_key_to_address(&signer.public_key()));
        assert!(signer.address().as_str().starts_with("0x"));
    }
}
