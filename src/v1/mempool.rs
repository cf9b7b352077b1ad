use std::{collections::HashSet, sync::Mutex};

/// The shared set of submitted-but-unmined transactions, in serialized form.
/// Adding the same bytes twice is a no-op, and removal of an absent member is
/// not an error. Nothing here survives a restart.
#[derive(Default)]
pub struct Mempool {
    members: Mutex<HashSet<Vec<u8>>>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    /// Returns true if the transaction was not already pending.
    pub fn add(&self, tx_bytes: Vec<u8>) -> bool {
        self.members.lock().unwrap().insert(tx_bytes)
    }

    /// An unordered snapshot of the pending set.
    pub fn members(&self) -> Vec<Vec<u8>> {
        self.members.lock().unwrap().iter().cloned().collect()
    }

    pub fn remove_many(&self, items: &[Vec<u8>]) {
        let mut members = self.members.lock().unwrap();
        for item in items {
            members.remove(item);
        }
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let mempool = Mempool::new();

        assert!(mempool.add(b"txn-a".to_vec()));
        assert!(!mempool.add(b"txn-a".to_vec()));
        assert!(mempool.add(b"txn-b".to_vec()));
        assert_eq!(mempool.len(), 2);
    }

    #[test]
    fn remove_many_is_best_effort() {
        let mempool = Mempool::new();
        mempool.add(b"txn-a".to_vec());
        mempool.add(b"txn-b".to_vec());

        mempool.remove_many(&[b"txn-a".to_vec(), b"never-added".to_vec()]);

        assert_eq!(mempool.members(), vec![b"txn-b".to_vec()]);
    }

    #[test]
    fn members_is_a_snapshot() {
        let mempool = Mempool::new();
        mempool.add(b"txn-a".to_vec());

        let snapshot = mempool.members();
        mempool.remove_many(&snapshot);

        assert!(mempool.is_empty());
        assert_eq!(snapshot.len(), 1);
    }
}
