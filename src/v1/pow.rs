use std::sync::atomic::{AtomicBool, Ordering};

use num_bigint::BigUint;
use num_traits::One;

use crate::wallet::{sha256, Hash256};

use super::block::Block;

/// Number of leading zero bits a block hash must have.
pub const DIFFICULTY: u64 = 16;

/// How many nonces to try between checks of the cancel flag.
const CANCEL_CHECK_INTERVAL: i64 = 4096;

/// A hash is valid iff, read as a big-endian 256-bit integer, it is strictly
/// below this target.
pub fn target() -> BigUint {
    BigUint::one() << (256 - DIFFICULTY as usize)
}

fn prepare_data(prev_block_hash: &[u8], tx_hash: &Hash256, timestamp: i64, nonce: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(prev_block_hash.len() + tx_hash.len() + 24);
    data.extend_from_slice(prev_block_hash);
    data.extend_from_slice(tx_hash);
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(&(DIFFICULTY as i64).to_be_bytes());
    data.extend_from_slice(&nonce.to_be_bytes());

    data
}

/// Searches nonces from zero until the block hash falls below the target.
/// Returns None if the cancel flag was raised before a solution was found.
pub fn run(block: &Block, cancel: &AtomicBool) -> Option<(i64, Hash256)> {
    let target = target();
    let tx_hash = block.hash_transactions();
    let mut nonce: i64 = 0;

    while nonce < i64::MAX {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return None;
        }

        let hash = sha256(&prepare_data(
            &block.prev_block_hash,
            &tx_hash,
            block.timestamp,
            nonce,
        ));

        if BigUint::from_bytes_be(&hash) < target {
            return Some((nonce, hash));
        }

        nonce += 1;
    }

    None
}

/// Recomputes the preimage with the stored nonce and checks it against the
/// target and the stored hash.
pub fn validate(block: &Block) -> bool {
    let hash = sha256(&prepare_data(
        &block.prev_block_hash,
        &block.hash_transactions(),
        block.timestamp,
        block.nonce,
    ));

    hash.as_slice() == block.hash.as_slice() && BigUint::from_bytes_be(&hash) < target()
}
