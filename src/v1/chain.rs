use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::AtomicBool, RwLock},
};

use thiserror::Error;
use tracing::info;

use super::{
    block::Block,
    transaction::{new_coinbase, Transaction, BLOCK_REWARD},
};

/// Default location of the embedded store.
pub const DB_PATH: &str = "./tmp/blocks";

const LAST_HASH_KEY: &[u8] = b"lh";
pub const UTXO_PREFIX: &[u8] = b"utxo-";
const CONTRACT_CODE_PREFIX: &[u8] = b"contract-code-";
const CONTRACT_STATE_PREFIX: &[u8] = b"contract-state-";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("store error: {0}")]
    Store(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("blockchain is not initialized; run `init` first")]
    NotInitialized,
    #[error("blockchain was opened read-only")]
    ReadOnly,
    #[error("cannot create genesis block: {0}")]
    Genesis(String),
}

pub fn contract_code_key(address: &[u8]) -> Vec<u8> {
    let mut key = CONTRACT_CODE_PREFIX.to_vec();
    key.extend_from_slice(address);
    key
}

pub fn contract_state_key(address: &[u8], user_key: &[u8]) -> Vec<u8> {
    let mut key = CONTRACT_STATE_PREFIX.to_vec();
    key.extend_from_slice(address);
    key.extend_from_slice(user_key);
    key
}

/// Contract writes accumulated during one mining pass. They become durable in
/// the same atomic batch that commits the block, so a crash mid-pass leaves
/// no orphan contract state behind.
#[derive(Default, Clone, Debug)]
pub struct ContractStaging {
    code: HashMap<Vec<u8>, Vec<u8>>,
    state: HashMap<Vec<u8>, Vec<u8>>,
}

impl ContractStaging {
    pub fn stage_code(&mut self, address: Vec<u8>, code: Vec<u8>) {
        self.code.insert(address, code);
    }

    pub fn staged_code(&self, address: &[u8]) -> Option<&Vec<u8>> {
        self.code.get(address)
    }

    pub fn stage_state(&mut self, address: &[u8], user_key: &[u8], value: Vec<u8>) {
        self.state.insert(contract_state_key(address, user_key), value);
    }

    pub fn staged_state(&self, address: &[u8], user_key: &[u8]) -> Option<&Vec<u8>> {
        self.state.get(&contract_state_key(address, user_key))
    }
}

/// Handle to the persistent chain: an embedded store plus the cached tip
/// hash. Cloning is done at the `Arc` level by callers; all methods take
/// `&self` so one handle can be shared between the miner and the request
/// handlers.
pub struct Chain {
    db: sled::Db,
    last_hash: RwLock<Vec<u8>>,
    read_only: bool,
}

impl Chain {
    /// Opens the store and creates the genesis block (a single coinbase
    /// paying [BLOCK_REWARD] to `genesis_address`) if the chain is empty.
    pub fn init(genesis_address: &str, path: &str) -> Result<Chain, ChainError> {
        let db = sled::open(path)?;

        let last_hash = match db.get(LAST_HASH_KEY)? {
            Some(hash) => {
                info!("blockchain already initialized; continuing");
                hash.to_vec()
            }
            None => {
                let coinbase = new_coinbase(genesis_address, BLOCK_REWARD)
                    .map_err(|err| ChainError::Genesis(err.to_string()))?;
                let genesis = Block::new(vec![], vec![coinbase], &AtomicBool::new(false))
                    .expect("genesis proof-of-work cannot be cancelled");

                let mut batch = sled::Batch::default();
                batch.insert(genesis.hash.clone(), genesis.serialize()?);
                batch.insert(LAST_HASH_KEY, genesis.hash.clone());
                db.apply_batch(batch)?;
                db.flush()?;

                info!(hash = %hex::encode(&genesis.hash), "created genesis block");
                genesis.hash
            }
        };

        Ok(Chain {
            db,
            last_hash: RwLock::new(last_hash),
            read_only: false,
        })
    }

    /// Opens an existing chain read-write. Fails if the chain was never
    /// initialized.
    pub fn open(path: &str) -> Result<Chain, ChainError> {
        Chain::open_mode(path, false)
    }

    /// Opens an existing chain for queries only; every write path returns
    /// [ChainError::ReadOnly].
    pub fn open_readonly(path: &str) -> Result<Chain, ChainError> {
        Chain::open_mode(path, true)
    }

    fn open_mode(path: &str, read_only: bool) -> Result<Chain, ChainError> {
        let db = sled::open(path)?;
        let last_hash = db
            .get(LAST_HASH_KEY)?
            .ok_or(ChainError::NotInitialized)?
            .to_vec();

        Ok(Chain {
            db,
            last_hash: RwLock::new(last_hash),
            read_only,
        })
    }

    pub fn last_hash(&self) -> Vec<u8> {
        self.last_hash.read().unwrap().clone()
    }

    /// Commits a block: block body, tip pointer, and any staged contract
    /// writes go into a single atomic batch. The UTXO index is updated by
    /// the caller afterwards.
    pub fn append_block(
        &self,
        block: &Block,
        staging: &ContractStaging,
    ) -> Result<(), ChainError> {
        if self.read_only {
            return Err(ChainError::ReadOnly);
        }

        let mut batch = sled::Batch::default();
        batch.insert(block.hash.clone(), block.serialize()?);
        batch.insert(LAST_HASH_KEY, block.hash.clone());

        for (address, code) in &staging.code {
            batch.insert(contract_code_key(address), code.clone());
        }
        for (key, value) in &staging.state {
            batch.insert(key.clone(), value.clone());
        }

        self.db.apply_batch(batch)?;
        self.db.flush()?;

        let mut last_hash = self.last_hash.write().unwrap();
        *last_hash = block.hash.clone();

        Ok(())
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>, ChainError> {
        match self.db.get(hash)? {
            Some(bytes) => Ok(Some(Block::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Walks the chain from the tip back to genesis.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            current_hash: self.last_hash(),
            chain: self,
        }
    }

    pub fn find_transaction(&self, id: &[u8]) -> Option<Transaction> {
        for block in self.iter() {
            if let Some(tx) = block.get_txn(id) {
                return Some(tx.clone());
            }
        }

        None
    }

    /// Resolves every committed transaction referenced by `tx`'s inputs, in
    /// one walk. Inputs whose referent is missing are simply absent from the
    /// result; callers treat that as a verification failure.
    pub fn find_referenced_txs(&self, tx: &Transaction) -> HashMap<Vec<u8>, Transaction> {
        let mut wanted: HashSet<Vec<u8>> = tx
            .vin
            .iter()
            .filter(|input| !input.tx_id.is_empty())
            .map(|input| input.tx_id.clone())
            .collect();

        let mut out = HashMap::new();
        if wanted.is_empty() {
            return out;
        }

        for block in self.iter() {
            for block_tx in block.transactions {
                if wanted.remove(&block_tx.id) {
                    out.insert(block_tx.id.clone(), block_tx);
                }
            }

            if wanted.is_empty() {
                break;
            }
        }

        out
    }

    pub fn get_contract_code(&self, address: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self
            .db
            .get(contract_code_key(address))?
            .map(|bytes| bytes.to_vec()))
    }

    pub fn get_contract_state(
        &self,
        address: &[u8],
        user_key: &[u8],
    ) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self
            .db
            .get(contract_state_key(address, user_key))?
            .map(|bytes| bytes.to_vec()))
    }

    pub(crate) fn get_raw(&self, key: &[u8]) -> Result<Option<sled::IVec>, ChainError> {
        Ok(self.db.get(key)?)
    }

    pub(crate) fn scan_prefix(&self, prefix: &[u8]) -> sled::Iter {
        self.db.scan_prefix(prefix)
    }

    pub(crate) fn apply_batch(&self, batch: sled::Batch) -> Result<(), ChainError> {
        if self.read_only {
            return Err(ChainError::ReadOnly);
        }

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }
}

pub struct ChainIter<'a> {
    current_hash: Vec<u8>,
    chain: &'a Chain,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.current_hash.is_empty() {
            return None;
        }

        // A broken parent link or an undecodable block means the store is
        // corrupt; halting beats committing on top of garbage.
        let block = self
            .chain
            .get_block(&self.current_hash)
            .expect("store read failed while walking the chain")
            .expect("chain is broken: a prev_block_hash points at a missing block");

        self.current_hash = block.prev_block_hash.clone();

        Some(block)
    }
}
