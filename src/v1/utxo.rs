use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    block::Block,
    chain::{Chain, ChainError, UTXO_PREFIX},
    transaction::TxOutput,
};

/// One still-unspent output of a committed transaction, stored alongside its
/// original position in that transaction's vout list. Keeping the index
/// explicit means consuming an output never renumbers the survivors.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredOutput {
    pub index: i32,
    pub output: TxOutput,
}

/// A reference to a spendable output, as handed to wallets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SpendableUtxo {
    pub tx_id: Vec<u8>,
    pub vout_index: i32,
    pub amount: i64,
    pub pub_key_hash: Vec<u8>,
}

fn utxo_key(tx_id: &[u8]) -> Vec<u8> {
    let mut key = UTXO_PREFIX.to_vec();
    key.extend_from_slice(tx_id);
    key
}

pub struct UtxoSet {
    chain: Arc<Chain>,
}

impl UtxoSet {
    pub fn new(chain: Arc<Chain>) -> Self {
        UtxoSet { chain }
    }

    /// Rebuilds the whole `utxo-*` key-space from the chain: purge, then
    /// rewrite, in one atomic batch.
    pub fn reindex(&self) -> Result<usize, ChainError> {
        let all = self.find_all_utxos();

        let mut batch = sled::Batch::default();
        for item in self.chain.scan_prefix(UTXO_PREFIX) {
            let (key, _) = item?;
            batch.remove(key);
        }
        for (tx_id, outputs) in &all {
            batch.insert(utxo_key(tx_id), bincode::serialize(outputs)?);
        }
        self.chain.apply_batch(batch)?;

        info!(entries = all.len(), "UTXO set reindexed");

        Ok(all.len())
    }

    /// Walks tip to genesis. Spending transactions live in later blocks, so
    /// every consumed `(tx_id, index)` is recorded before the transaction
    /// that produced it is visited.
    fn find_all_utxos(&self) -> HashMap<Vec<u8>, Vec<StoredOutput>> {
        let mut spent: HashMap<Vec<u8>, Vec<i32>> = HashMap::new();
        let mut utxos: HashMap<Vec<u8>, Vec<StoredOutput>> = HashMap::new();

        for block in self.chain.iter() {
            for tx in &block.transactions {
                for (idx, output) in tx.vout.iter().enumerate() {
                    let idx = idx as i32;
                    if spent.get(&tx.id).map_or(false, |indices| indices.contains(&idx)) {
                        continue;
                    }

                    utxos.entry(tx.id.clone()).or_default().push(StoredOutput {
                        index: idx,
                        output: output.clone(),
                    });
                }

                if !tx.is_coinbase() {
                    for input in &tx.vin {
                        spent
                            .entry(input.tx_id.clone())
                            .or_default()
                            .push(input.vout_index);
                    }
                }
            }
        }

        utxos
    }

    /// Applies one committed block incrementally: consumed outputs drop out
    /// of their entries (empty entries are deleted), and every transaction
    /// gets a fresh entry for its own outputs.
    pub fn update(&self, block: &Block) -> Result<(), ChainError> {
        // Several transactions in one block may touch the same entry, so
        // mutations go through an in-memory overlay and hit the store once.
        let mut entries: HashMap<Vec<u8>, Vec<StoredOutput>> = HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    if !entries.contains_key(&input.tx_id) {
                        match self.load_entry(&input.tx_id)? {
                            Some(outputs) => {
                                entries.insert(input.tx_id.clone(), outputs);
                            }
                            None => continue,
                        }
                    }

                    let entry = entries.get_mut(&input.tx_id).unwrap();
                    entry.retain(|stored| stored.index != input.vout_index);
                }
            }

            let outputs: Vec<StoredOutput> = tx
                .vout
                .iter()
                .enumerate()
                .map(|(idx, output)| StoredOutput {
                    index: idx as i32,
                    output: output.clone(),
                })
                .collect();
            entries.insert(tx.id.clone(), outputs);
        }

        let mut batch = sled::Batch::default();
        for (tx_id, outputs) in entries {
            if outputs.is_empty() {
                batch.remove(utxo_key(&tx_id));
            } else {
                batch.insert(utxo_key(&tx_id), bincode::serialize(&outputs)?);
            }
        }

        self.chain.apply_batch(batch)
    }

    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<i64, ChainError> {
        let mut total: i64 = 0;

        for item in self.chain.scan_prefix(UTXO_PREFIX) {
            let (_, value) = item?;
            let outputs: Vec<StoredOutput> = bincode::deserialize(&value)?;

            total += outputs
                .iter()
                .filter(|stored| stored.output.is_locked_with(pub_key_hash))
                .map(|stored| stored.output.value)
                .sum::<i64>();
        }

        Ok(total)
    }

    /// Accumulates outputs locked by `pub_key_hash` in store key order,
    /// stopping as soon as the requested amount is covered. The caller
    /// checks whether `accumulated` actually reached `amount`.
    pub fn find_spendable(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, Vec<SpendableUtxo>), ChainError> {
        let mut accumulated: i64 = 0;
        let mut utxos: Vec<SpendableUtxo> = vec![];

        for item in self.chain.scan_prefix(UTXO_PREFIX) {
            let (key, value) = item?;
            let tx_id = key[UTXO_PREFIX.len()..].to_vec();
            let outputs: Vec<StoredOutput> = bincode::deserialize(&value)?;

            for stored in outputs {
                if stored.output.is_locked_with(pub_key_hash) && accumulated < amount {
                    accumulated += stored.output.value;
                    utxos.push(SpendableUtxo {
                        tx_id: tx_id.clone(),
                        vout_index: stored.index,
                        amount: stored.output.value,
                        pub_key_hash: stored.output.pub_key_hash.clone(),
                    });
                }
            }

            if accumulated >= amount {
                break;
            }
        }

        Ok((accumulated, utxos))
    }

    /// Whether `(tx_id, vout_index)` is still listed as unspent.
    pub fn is_unspent(&self, tx_id: &[u8], vout_index: i32) -> Result<bool, ChainError> {
        Ok(self
            .load_entry(tx_id)?
            .map_or(false, |outputs| {
                outputs.iter().any(|stored| stored.index == vout_index)
            }))
    }

    fn load_entry(&self, tx_id: &[u8]) -> Result<Option<Vec<StoredOutput>>, ChainError> {
        match self.chain.get_raw(&utxo_key(tx_id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The raw `utxo-*` key-space, sorted by key. Used to compare the
    /// incremental update against a full rebuild.
    #[cfg(test)]
    pub(crate) fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = vec![];
        for item in self.chain.scan_prefix(UTXO_PREFIX) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        out.sort();
        Ok(out)
    }
}
