use std::sync::atomic::AtomicBool;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::wallet::{sha256, Hash256};

use super::{pow, transaction::Transaction};

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Block {
    /// Unix seconds.
    pub timestamp: i64,
    /// Empty for the genesis block.
    pub prev_block_hash: Vec<u8>,
    pub hash: Vec<u8>,
    pub transactions: Vec<Transaction>,
    pub nonce: i64,
}

impl Block {
    /// Assembles a block over the given transactions and runs the
    /// proof-of-work search. Returns None if the search was cancelled.
    pub fn new(
        prev_block_hash: Vec<u8>,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Option<Block> {
        let mut block = Block {
            timestamp: Utc::now().timestamp(),
            prev_block_hash,
            hash: vec![],
            transactions,
            nonce: 0,
        };

        let (nonce, hash) = pow::run(&block, cancel)?;
        block.nonce = nonce;
        block.hash = hash.to_vec();

        Some(block)
    }

    /// SHA-256 over the concatenated transaction ids. Not a real Merkle
    /// tree, but deterministic, which is all the preimage needs.
    pub fn hash_transactions(&self) -> Hash256 {
        let mut ids: Vec<u8> = vec![];
        for tx in &self.transactions {
            ids.extend_from_slice(&tx.id);
        }

        sha256(&ids)
    }

    pub fn get_txn(&self, id: &[u8]) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.id == id)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_empty()
    }

    pub fn serialize(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> bincode::Result<Block> {
        bincode::deserialize(data)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("timestamp", &self.timestamp)
            .field("prev_block_hash", &hex::encode(&self.prev_block_hash))
            .field("hash", &hex::encode(&self.hash))
            .field("transactions", &self.transactions.len())
            .field("nonce", &self.nonce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v1::transaction::{new_coinbase, BLOCK_REWARD};
    use crate::wallet::{encode_address, Keypair};

    fn coinbase() -> Transaction {
        let address = encode_address(&Keypair::generate().public_key_bytes());
        new_coinbase(&address, BLOCK_REWARD).unwrap()
    }

    #[test]
    fn transaction_order_changes_the_aggregate_hash() {
        let a = coinbase();
        let b = coinbase();

        let mut block = Block {
            timestamp: 0,
            prev_block_hash: vec![],
            hash: vec![],
            transactions: vec![a, b],
            nonce: 0,
        };

        let before = block.hash_transactions();
        block.transactions.swap(0, 1);
        let after = block.hash_transactions();

        assert_ne!(before, after);
    }

    #[test]
    fn serialize_roundtrip() {
        let block = Block::new(
            vec![],
            vec![coinbase()],
            &std::sync::atomic::AtomicBool::new(false),
        )
        .unwrap();

        let bytes = block.serialize().unwrap();
        let decoded = Block::deserialize(&bytes).unwrap();

        assert_eq!(decoded, block);
    }

    #[test]
    fn genesis_has_no_parent() {
        let block = Block::new(
            vec![],
            vec![coinbase()],
            &std::sync::atomic::AtomicBool::new(false),
        )
        .unwrap();

        assert!(block.is_genesis());

        let child = Block::new(
            block.hash.clone(),
            vec![coinbase()],
            &std::sync::atomic::AtomicBool::new(false),
        )
        .unwrap();

        assert!(!child.is_genesis());
        assert_eq!(child.prev_block_hash, block.hash);
    }

    #[test]
    fn txn_lookup_by_id() {
        let a = coinbase();
        let b = coinbase();
        let block = Block {
            timestamp: 0,
            prev_block_hash: vec![],
            hash: vec![],
            transactions: vec![a.clone(), b.clone()],
            nonce: 0,
        };

        assert_eq!(block.get_txn(&b.id), Some(&b));
        assert_eq!(block.get_txn(&[0x55; 32]), None);
    }
}
