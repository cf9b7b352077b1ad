use std::collections::HashSet;

use crate::wallet::{PUBLIC_KEY_LEN, SIGNATURE_LEN};

use super::chain::Chain;
use super::transaction::Transaction;
use super::txn_verify_error::ErrorKind::{
    BadInputRef, BadKeyLength, BadSignatureLength, Coinbase, EmptyVin, EmptyVout, InvalidId,
    MissingInput, NegativeOutput, Overspend, SpentOutput, StoreUnavailable,
};
use super::txn_verify_error::TxnVerifyResult;
use super::utxo::UtxoSet;

/// Cheap well-formedness checks, applied when a transaction is submitted.
/// Signature verification is deliberately deferred to the miner.
pub fn check_structure(tx: &Transaction) -> TxnVerifyResult<()> {
    if tx.is_coinbase() {
        return Err(Box::new(Coinbase));
    }

    if tx.vin.is_empty() {
        return Err(Box::new(EmptyVin));
    }

    if tx.vout.is_empty() {
        return Err(Box::new(EmptyVout));
    }

    for output in &tx.vout {
        if output.value < 0 {
            return Err(Box::new(NegativeOutput(output.value)));
        }
    }

    for input in &tx.vin {
        if input.public_key.len() != PUBLIC_KEY_LEN {
            return Err(Box::new(BadKeyLength(input.public_key.len())));
        }
        if input.signature.len() != SIGNATURE_LEN {
            return Err(Box::new(BadSignatureLength(input.signature.len())));
        }
    }

    if !tx.is_valid_id() {
        return Err(Box::new(InvalidId));
    }

    Ok(())
}

/// The authoritative check, run by the miner before a transaction goes into
/// a block. `spent_in_pass` carries the outputs consumed by transactions
/// already accepted in the current mining pass, so two pending transactions
/// cannot spend the same output even though neither is committed yet.
pub fn verify_transaction(
    tx: &Transaction,
    chain: &Chain,
    utxo: &UtxoSet,
    spent_in_pass: &HashSet<(Vec<u8>, i32)>,
) -> TxnVerifyResult<()> {
    check_structure(tx)?;

    let prev_txs = chain.find_referenced_txs(tx);

    let mut input_sum: i64 = 0;

    for input in &tx.vin {
        let prev = match prev_txs.get(&input.tx_id) {
            Some(prev) => prev,
            None => return Err(Box::new(MissingInput(input.tx_id.clone()))),
        };

        if input.vout_index < 0 || input.vout_index as usize >= prev.vout.len() {
            return Err(Box::new(BadInputRef(input.tx_id.clone(), input.vout_index)));
        }

        let unspent = utxo
            .is_unspent(&input.tx_id, input.vout_index)
            .map_err(|_| Box::new(StoreUnavailable))?;

        if !unspent || spent_in_pass.contains(&(input.tx_id.clone(), input.vout_index)) {
            return Err(Box::new(SpentOutput(input.tx_id.clone(), input.vout_index)));
        }

        input_sum += prev.vout[input.vout_index as usize].value;
    }

    let output_sum: i64 = tx.vout.iter().map(|output| output.value).sum();
    if output_sum > input_sum {
        return Err(Box::new(Overspend(input_sum, output_sum)));
    }

    tx.verify_signatures(&prev_txs)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::v1::transaction::{new_transfer, TxType};
    use crate::v1::txn_verify_error::ErrorKind;
    use crate::wallet::{encode_address, Keypair};

    struct Fixture {
        chain: Arc<Chain>,
        utxo: UtxoSet,
        genesis_keypair: Keypair,
        _dir: tempfile::TempDir,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let keypair = Keypair::generate();
        let address = encode_address(&keypair.public_key_bytes());

        let chain = Arc::new(Chain::init(&address, dir.path().to_str().unwrap()).unwrap());
        let utxo = UtxoSet::new(Arc::clone(&chain));
        utxo.reindex().unwrap();

        Fixture {
            chain,
            utxo,
            genesis_keypair: keypair,
            _dir: dir,
        }
    }

    fn signed_transfer(fixture: &Fixture, amount: i64) -> Transaction {
        let recipient = encode_address(&Keypair::generate().public_key_bytes());
        let (accumulated, utxos) = fixture
            .utxo
            .find_spendable(&fixture.genesis_keypair.address(), amount)
            .unwrap();

        new_transfer(&fixture.genesis_keypair, &recipient, amount, accumulated, &utxos).unwrap()
    }

    fn verify(fixture: &Fixture, tx: &Transaction) -> TxnVerifyResult<()> {
        verify_transaction(tx, &fixture.chain, &fixture.utxo, &HashSet::new())
    }

    #[test]
    fn valid_transfer_passes() {
        let fixture = setup();
        let tx = signed_transfer(&fixture, 40);

        assert!(verify(&fixture, &tx).is_ok());
    }

    #[test]
    fn tampered_signature_fails() {
        let fixture = setup();
        let mut tx = signed_transfer(&fixture, 40);
        tx.vin[0].signature[0] ^= 0x01;

        assert!(matches!(
            *verify(&fixture, &tx).unwrap_err(),
            ErrorKind::BadSignature(_)
        ));
    }

    #[test]
    fn unknown_input_fails() {
        let fixture = setup();
        let recipient = encode_address(&Keypair::generate().public_key_bytes());

        // Signed against a stand-in for a transaction the chain never saw.
        let utxos = vec![crate::v1::utxo::SpendableUtxo {
            tx_id: vec![0xee; 32],
            vout_index: 0,
            amount: 100,
            pub_key_hash: fixture.genesis_keypair.address().to_vec(),
        }];
        let tx = new_transfer(&fixture.genesis_keypair, &recipient, 100, 100, &utxos).unwrap();

        assert!(matches!(
            *verify(&fixture, &tx).unwrap_err(),
            ErrorKind::MissingInput(_)
        ));
    }

    #[test]
    fn double_spend_within_a_pass_fails() {
        let fixture = setup();
        let tx = signed_transfer(&fixture, 40);

        let mut spent_in_pass = HashSet::new();
        for input in &tx.vin {
            spent_in_pass.insert((input.tx_id.clone(), input.vout_index));
        }

        let result = verify_transaction(&tx, &fixture.chain, &fixture.utxo, &spent_in_pass);
        assert!(matches!(*result.unwrap_err(), ErrorKind::SpentOutput(_, _)));
    }

    #[test]
    fn minting_value_fails() {
        let fixture = setup();
        let recipient = encode_address(&Keypair::generate().public_key_bytes());

        // Properly signed over a claimed 1000, but the referenced outputs
        // only hold 100.
        let (_, utxos) = fixture
            .utxo
            .find_spendable(&fixture.genesis_keypair.address(), 1_000)
            .unwrap();
        let tx =
            new_transfer(&fixture.genesis_keypair, &recipient, 1_000, 1_000, &utxos).unwrap();

        assert!(matches!(
            *verify(&fixture, &tx).unwrap_err(),
            ErrorKind::Overspend(_, _)
        ));
    }

    #[test]
    fn structural_garbage_is_rejected() {
        let fixture = setup();

        let mut no_outputs = signed_transfer(&fixture, 40);
        no_outputs.vout.clear();
        assert!(matches!(
            *verify(&fixture, &no_outputs).unwrap_err(),
            ErrorKind::EmptyVout
        ));

        let mut negative = signed_transfer(&fixture, 40);
        negative.vout[0].value = -5;
        assert!(matches!(
            *verify(&fixture, &negative).unwrap_err(),
            ErrorKind::NegativeOutput(-5)
        ));

        let mut bad_id = signed_transfer(&fixture, 40);
        bad_id.id[0] ^= 0x01;
        assert!(matches!(
            *verify(&fixture, &bad_id).unwrap_err(),
            ErrorKind::InvalidId
        ));

        let mut wrong_type = signed_transfer(&fixture, 40);
        wrong_type.tx_type = TxType::ContractDeploy;
        assert!(matches!(
            *verify(&fixture, &wrong_type).unwrap_err(),
            ErrorKind::InvalidId
        ));
    }

    #[test]
    fn submitted_coinbase_is_rejected() {
        let fixture = setup();
        let genesis_txn = fixture.chain.iter().next().unwrap().transactions[0].clone();

        assert!(matches!(
            *check_structure(&genesis_txn).unwrap_err(),
            ErrorKind::Coinbase
        ));
    }
}
