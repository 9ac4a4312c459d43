//! Durable stores behind narrow traits: pool entries keyed by a canonical
//! string form, per-wallet signers keyed by wallet public key hash.

mod memory;
mod rocks;

pub use memory::{MemoryPoolPersistence, MemorySignerStorage};
pub use rocks::RocksStore;

use crate::domain::wallet::Signer;
use crate::foundation::{Result, WalletId};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// An element storable in a parameter pool.
pub trait PoolElement: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Canonical string form of the element, used as the persistence key.
    fn pool_key(&self) -> String;
}

impl PoolElement for crate::domain::dkg::EcdsaPreParams {
    fn pool_key(&self) -> String {
        hex::encode(blake3::hash(&self.blob).as_bytes())
    }
}

/// Durable store backing a parameter pool.
pub trait PoolPersistence<T: PoolElement>: Send + Sync {
    fn save(&self, element: &T) -> Result<()>;
    fn delete(&self, element: &T) -> Result<()>;
    fn read_all(&self) -> Result<Vec<T>>;
}

/// Durable store of per-wallet signing material.
pub trait SignerStorage: Send + Sync {
    fn save_signer(&self, wallet_id: &WalletId, signer: &Signer) -> Result<()>;
    fn load_signers(&self) -> Result<Vec<(WalletId, Signer)>>;
    fn remove_signer(&self, wallet_id: &WalletId) -> Result<()>;
}
