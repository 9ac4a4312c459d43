//! Registry of this operator's per-wallet signing material. The registry is
//! the single writer of signer state; reads are concurrent.

use crate::domain::wallet::Signer;
use crate::foundation::{Result, WalletId};
use crate::infrastructure::storage::SignerStorage;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct WalletRegistry {
    storage: Arc<dyn SignerStorage>,
    signers: RwLock<HashMap<WalletId, Signer>>,
}

impl WalletRegistry {
    /// Opens the registry, loading all persisted signers.
    pub fn new(storage: Arc<dyn SignerStorage>) -> Result<Self> {
        let signers: HashMap<WalletId, Signer> = storage.load_signers()?.into_iter().collect();
        info!("wallet registry loaded {} signers", signers.len());
        Ok(Self { storage, signers: RwLock::new(signers) })
    }

    /// Persists and registers a signer. Persistence happens first so a crash
    /// between the two steps loses nothing.
    pub fn register_signer(&self, signer: &Signer) -> Result<()> {
        let wallet_id = signer.wallet_id()?;
        self.storage.save_signer(&wallet_id, signer)?;
        self.signers.write().unwrap_or_else(|poisoned| poisoned.into_inner()).insert(wallet_id, signer.clone());
        debug!("wallet registry holds signer for wallet {}", wallet_id);
        Ok(())
    }

    pub fn get_signer(&self, wallet_id: &WalletId) -> Option<Signer> {
        self.signers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).get(wallet_id).cloned()
    }

    pub fn wallet_ids(&self) -> Vec<WalletId> {
        self.signers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).keys().copied().collect()
    }
}
