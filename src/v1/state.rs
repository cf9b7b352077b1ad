use std::sync::{atomic::AtomicBool, Arc, Mutex};

use super::{chain::Chain, mempool::Mempool, utxo::UtxoSet};

/// Everything the long-lived tasks share: one chain handle, one UTXO view
/// over it, one mempool. Wrapped in an `Arc` and handed to the request
/// listeners and the mining loop.
pub struct State {
    pub chain: Arc<Chain>,
    pub utxo: UtxoSet,
    pub mempool: Mempool,
    pub known_nodes: Mutex<Vec<String>>,
    /// Raised on shutdown. The mining loop checks it between passes and the
    /// proof-of-work search polls it mid-search.
    pub shutdown: AtomicBool,
}

impl State {
    pub fn new(chain: Arc<Chain>) -> State {
        let utxo = UtxoSet::new(Arc::clone(&chain));

        State {
            chain,
            utxo,
            mempool: Mempool::new(),
            known_nodes: Mutex::new(vec![]),
            shutdown: AtomicBool::new(false),
        }
    }
}
