use crate::domain::wallet::Signer;
use crate::foundation::{BridgeError, Result, WalletId};
use crate::infrastructure::storage::{PoolElement, PoolPersistence, SignerStorage};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard};

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory pool persistence used by tests.
pub struct MemoryPoolPersistence<T> {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    _element: PhantomData<T>,
}

impl<T> MemoryPoolPersistence<T> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(BTreeMap::new()), _element: PhantomData }
    }

    pub fn len(&self) -> usize {
        lock_recovering(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock_recovering(&self.entries).contains_key(key)
    }
}

impl<T> Default for MemoryPoolPersistence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PoolElement> PoolPersistence<T> for MemoryPoolPersistence<T> {
    fn save(&self, element: &T) -> Result<()> {
        let encoded = bincode::serialize(element)?;
        lock_recovering(&self.entries).insert(element.pool_key(), encoded);
        Ok(())
    }

    fn delete(&self, element: &T) -> Result<()> {
        lock_recovering(&self.entries).remove(&element.pool_key());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<T>> {
        lock_recovering(&self.entries)
            .values()
            .map(|encoded| bincode::deserialize(encoded).map_err(BridgeError::from))
            .collect()
    }
}

/// In-memory signer store used by tests.
pub struct MemorySignerStorage {
    signers: Mutex<BTreeMap<WalletId, Signer>>,
}

impl MemorySignerStorage {
    pub fn new() -> Self {
        Self { signers: Mutex::new(BTreeMap::new()) }
    }
}

impl Default for MemorySignerStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerStorage for MemorySignerStorage {
    fn save_signer(&self, wallet_id: &WalletId, signer: &Signer) -> Result<()> {
        lock_recovering(&self.signers).insert(*wallet_id, signer.clone());
        Ok(())
    }

    fn load_signers(&self) -> Result<Vec<(WalletId, Signer)>> {
        Ok(lock_recovering(&self.signers).iter().map(|(id, signer)| (*id, signer.clone())).collect())
    }

    fn remove_signer(&self, wallet_id: &WalletId) -> Result<()> {
        lock_recovering(&self.signers).remove(wallet_id);
        Ok(())
    }
}
