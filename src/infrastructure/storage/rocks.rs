//! RocksDB-backed durable store. One column family per concern.

use crate::domain::wallet::Signer;
use crate::foundation::{BridgeError, Result, WalletId};
use crate::infrastructure::storage::{PoolElement, PoolPersistence, SignerStorage};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use std::path::Path;

const CF_PRE_PARAMS: &str = "pre_params";
const CF_SIGNERS: &str = "signers";

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PRE_PARAMS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SIGNERS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&options, path, descriptors)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| BridgeError::storage("cf_handle", format!("missing column family {}", name)))
    }
}

impl<T: PoolElement> PoolPersistence<T> for RocksStore {
    fn save(&self, element: &T) -> Result<()> {
        let encoded = bincode::serialize(element)?;
        self.db.put_cf(self.cf(CF_PRE_PARAMS)?, element.pool_key().as_bytes(), encoded)?;
        Ok(())
    }

    fn delete(&self, element: &T) -> Result<()> {
        self.db.delete_cf(self.cf(CF_PRE_PARAMS)?, element.pool_key().as_bytes())?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<T>> {
        let cf = self.cf(CF_PRE_PARAMS)?;
        let mut elements = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = entry?;
            elements.push(bincode::deserialize(&value)?);
        }
        Ok(elements)
    }
}

impl SignerStorage for RocksStore {
    fn save_signer(&self, wallet_id: &WalletId, signer: &Signer) -> Result<()> {
        let encoded = bincode::serialize(signer)?;
        self.db.put_cf(self.cf(CF_SIGNERS)?, wallet_id.as_bytes(), encoded)?;
        Ok(())
    }

    fn load_signers(&self) -> Result<Vec<(WalletId, Signer)>> {
        let cf = self.cf(CF_SIGNERS)?;
        let mut signers = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let key: [u8; 20] = key.as_ref().try_into().map_err(|_| {
                BridgeError::storage("load_signers", format!("malformed wallet id key of {} bytes", key.len()))
            })?;
            signers.push((WalletId::new(key), bincode::deserialize(&value)?));
        }
        Ok(signers)
    }

    fn remove_signer(&self, wallet_id: &WalletId) -> Result<()> {
        self.db.delete_cf(self.cf(CF_SIGNERS)?, wallet_id.as_bytes())?;
        Ok(())
    }
}
