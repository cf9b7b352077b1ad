use std::{collections::HashMap, error::Error};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::wallet::{
    decode_address, hash_pubkey, sha256, verify_signature, Hash256, Keypair, PUBLIC_KEY_LEN,
    SIGNATURE_LEN,
};

use super::txn_verify_error::ErrorKind::{
    BadInputRef, BadKeyLength, BadSignature, BadSignatureLength, KeyMismatch, MissingInput,
};
use super::txn_verify_error::TxnVerifyResult;
use super::utxo::SpendableUtxo;

/// Amount minted by every coinbase transaction, the genesis one included.
pub const BLOCK_REWARD: i64 = 100;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Transfer,
    ContractDeploy,
    ContractCall,
}

impl TxType {
    pub fn tag(&self) -> i32 {
        match self {
            TxType::Transfer => 0,
            TxType::ContractDeploy => 1,
            TxType::ContractCall => 2,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub tx_id: Vec<u8>,
    pub vout_index: i32,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: i64,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    pub fn is_locked_with(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: Vec<u8>,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
    pub tx_type: TxType,
    /// Empty for transfers, contract source for deploys, JSON call
    /// descriptor for contract calls.
    pub payload: Vec<u8>,
}

/// The hash pre-image is a compact JSON rendering with fixed field order,
/// base64 byte fields and decimal-string values, so that web wallets can
/// reproduce the exact bytes without native 64-bit integers.
#[derive(Serialize)]
struct CanonicalTxn {
    id: String,
    #[serde(rename = "vinList")]
    vin_list: Vec<CanonicalInput>,
    #[serde(rename = "voutList")]
    vout_list: Vec<CanonicalOutput>,
    #[serde(rename = "type")]
    tx_type: i32,
    payload: String,
}

#[derive(Serialize)]
struct CanonicalInput {
    #[serde(rename = "txId")]
    tx_id: String,
    #[serde(rename = "voutIndex")]
    vout_index: i32,
    signature: String,
    #[serde(rename = "publicKey")]
    public_key: String,
}

#[derive(Serialize)]
struct CanonicalOutput {
    value: String,
    #[serde(rename = "pubKeyHash")]
    pub_key_hash: String,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].tx_id.is_empty()
    }

    /// SHA-256 of the canonical JSON form, rendered from the fields as they
    /// currently are. Callers that want the identity hash must clear the
    /// id and signatures first ([Transaction::set_id] does).
    pub fn canonical_hash(&self) -> Hash256 {
        let doc = CanonicalTxn {
            id: BASE64.encode(&self.id),
            vin_list: self
                .vin
                .iter()
                .map(|input| CanonicalInput {
                    tx_id: BASE64.encode(&input.tx_id),
                    vout_index: input.vout_index,
                    signature: BASE64.encode(&input.signature),
                    public_key: BASE64.encode(&input.public_key),
                })
                .collect(),
            vout_list: self
                .vout
                .iter()
                .map(|output| CanonicalOutput {
                    value: output.value.to_string(),
                    pub_key_hash: BASE64.encode(&output.pub_key_hash),
                })
                .collect(),
            tx_type: self.tx_type.tag(),
            payload: BASE64.encode(&self.payload),
        };

        let bytes = serde_json::to_vec(&doc).expect("canonical transaction form always serializes");

        sha256(&bytes)
    }

    /// Computes and assigns the transaction id. The id and input signatures
    /// do not participate in the hash; signatures are computed afterwards.
    pub fn set_id(&mut self) {
        self.id = vec![];
        let saved_sigs: Vec<Vec<u8>> = self
            .vin
            .iter_mut()
            .map(|input| std::mem::take(&mut input.signature))
            .collect();

        let hash = self.canonical_hash();

        for (input, sig) in self.vin.iter_mut().zip(saved_sigs) {
            input.signature = sig;
        }

        self.id = hash.to_vec();
    }

    pub fn is_valid_id(&self) -> bool {
        let mut copy = self.clone();
        copy.set_id();
        copy.id == self.id
    }

    /// A copy with every input's signature and public key cleared, used to
    /// build per-input signing digests.
    fn trimmed_copy(&self) -> Transaction {
        Transaction {
            id: self.id.clone(),
            vin: self
                .vin
                .iter()
                .map(|input| TxInput {
                    tx_id: input.tx_id.clone(),
                    vout_index: input.vout_index,
                    signature: vec![],
                    public_key: vec![],
                })
                .collect(),
            vout: self.vout.clone(),
            tx_type: self.tx_type,
            payload: self.payload.clone(),
        }
    }

    /// Signs every input. For input `i`, the referenced output's locking hash
    /// is placed in the trimmed copy's public key slot so it participates in
    /// that input's digest, then reset before moving to the next input.
    pub fn sign(
        &mut self,
        keypair: &Keypair,
        prev_txs: &HashMap<Vec<u8>, Transaction>,
    ) -> Result<(), Box<dyn Error>> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut trimmed = self.trimmed_copy();

        for i in 0..self.vin.len() {
            let prev = prev_txs.get(&self.vin[i].tx_id).ok_or_else(|| {
                format!(
                    "Cannot sign: input references unknown transaction {}",
                    hex::encode(&self.vin[i].tx_id)
                )
            })?;

            let vout_index = self.vin[i].vout_index;
            if vout_index < 0 || vout_index as usize >= prev.vout.len() {
                return Err(format!(
                    "Cannot sign: input references output {} of transaction {}, which does not exist",
                    vout_index,
                    hex::encode(&self.vin[i].tx_id)
                )
                .into());
            }

            trimmed.vin[i].public_key = prev.vout[vout_index as usize].pub_key_hash.clone();
            let digest = trimmed.canonical_hash();
            trimmed.vin[i].public_key = vec![];

            self.vin[i].signature = keypair.sign(&digest);
            self.vin[i].public_key = keypair.public_key_bytes();
        }

        Ok(())
    }

    /// Mirrors [Transaction::sign]: rebuilds each input's digest with the
    /// locking hash injected and verifies with the public key the input
    /// carries. Any failure makes the whole transaction invalid.
    pub fn verify_signatures(
        &self,
        prev_txs: &HashMap<Vec<u8>, Transaction>,
    ) -> TxnVerifyResult<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut trimmed = self.trimmed_copy();

        for (i, input) in self.vin.iter().enumerate() {
            let prev = prev_txs
                .get(&input.tx_id)
                .ok_or_else(|| Box::new(MissingInput(input.tx_id.clone())))?;

            if input.vout_index < 0 || input.vout_index as usize >= prev.vout.len() {
                return Err(Box::new(BadInputRef(input.tx_id.clone(), input.vout_index)));
            }

            if input.public_key.len() != PUBLIC_KEY_LEN {
                return Err(Box::new(BadKeyLength(input.public_key.len())));
            }

            if input.signature.len() != SIGNATURE_LEN {
                return Err(Box::new(BadSignatureLength(input.signature.len())));
            }

            let locking_hash = &prev.vout[input.vout_index as usize].pub_key_hash;
            if hash_pubkey(&input.public_key).as_slice() != locking_hash.as_slice() {
                return Err(Box::new(KeyMismatch(input.tx_id.clone(), input.vout_index)));
            }

            trimmed.vin[i].public_key = locking_hash.clone();
            let digest = trimmed.canonical_hash();
            trimmed.vin[i].public_key = vec![];

            if !verify_signature(&input.public_key, &digest, &input.signature) {
                return Err(Box::new(BadSignature(i)));
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &hex::encode(&self.id))
            .field("vin", &self.vin)
            .field("vout", &self.vout)
            .field("tx_type", &self.tx_type)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl std::fmt::Debug for TxInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxInput")
            .field("tx_id", &hex::encode(&self.tx_id))
            .field("vout_index", &self.vout_index)
            .field("signature", &hex::encode(&self.signature))
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

/// The address hash of whoever created a (non-coinbase) transaction. All
/// inputs are signed by the same wallet, so the first input's key is enough.
pub fn sender_pub_key_hash(tx: &Transaction) -> Option<Vec<u8>> {
    if tx.is_coinbase() {
        return None;
    }

    tx.vin
        .first()
        .map(|input| hash_pubkey(&input.public_key).to_vec())
}

/// The coinbase input carries a random placeholder in its public key slot so
/// that two rewards to the same address never hash to the same id.
pub fn new_coinbase(to_address: &str, amount: i64) -> Result<Transaction, Box<dyn Error>> {
    let extra_nonce: [u8; 32] = rand::random();

    let txin = TxInput {
        tx_id: vec![],
        vout_index: -1,
        signature: vec![],
        public_key: extra_nonce.to_vec(),
    };

    let txout = TxOutput {
        value: amount,
        pub_key_hash: decode_address(to_address)?.to_vec(),
    };

    let mut tx = Transaction {
        id: vec![],
        vin: vec![txin],
        vout: vec![txout],
        tx_type: TxType::Transfer,
        payload: vec![],
    };
    tx.set_id();

    Ok(tx)
}

/// Turns a spendable-output selection into transaction inputs, plus sparse
/// stand-ins for the referenced transactions so [Transaction::sign] can find
/// each locking hash without a full copy of the chain.
fn build_inputs(
    utxos: &[SpendableUtxo],
    public_key: Vec<u8>,
) -> (Vec<TxInput>, HashMap<Vec<u8>, Transaction>) {
    let mut inputs: Vec<TxInput> = Vec::with_capacity(utxos.len());
    let mut prev_txs: HashMap<Vec<u8>, Transaction> = HashMap::new();

    for utxo in utxos {
        inputs.push(TxInput {
            tx_id: utxo.tx_id.clone(),
            vout_index: utxo.vout_index,
            signature: vec![],
            public_key: public_key.clone(),
        });

        let entry = prev_txs
            .entry(utxo.tx_id.clone())
            .or_insert_with(|| Transaction {
                id: utxo.tx_id.clone(),
                vin: vec![],
                vout: vec![],
                tx_type: TxType::Transfer,
                payload: vec![],
            });

        let idx = utxo.vout_index as usize;
        if entry.vout.len() <= idx {
            entry.vout.resize(
                idx + 1,
                TxOutput {
                    value: 0,
                    pub_key_hash: vec![],
                },
            );
        }
        entry.vout[idx] = TxOutput {
            value: utxo.amount,
            pub_key_hash: utxo.pub_key_hash.clone(),
        };
    }

    (inputs, prev_txs)
}

/// A signed transfer spending the given selection, with change back to the
/// sender when the selection overshoots.
pub fn new_transfer(
    keypair: &Keypair,
    to_address: &str,
    amount: i64,
    accumulated: i64,
    utxos: &[SpendableUtxo],
) -> Result<Transaction, Box<dyn Error>> {
    if accumulated < amount {
        return Err(format!("Insufficient funds: have {}, need {}", accumulated, amount).into());
    }

    let (vin, prev_txs) = build_inputs(utxos, keypair.public_key_bytes());

    let mut vout = vec![TxOutput {
        value: amount,
        pub_key_hash: decode_address(to_address)?.to_vec(),
    }];

    if accumulated > amount {
        vout.push(TxOutput {
            value: accumulated - amount,
            pub_key_hash: keypair.address().to_vec(),
        });
    }

    let mut tx = Transaction {
        id: vec![],
        vin,
        vout,
        tx_type: TxType::Transfer,
        payload: vec![],
    };
    tx.set_id();
    tx.sign(keypair, &prev_txs)?;

    Ok(tx)
}

/// A signed contract transaction (deploy or call). The whole selection comes
/// back to the sender as change; the payload carries the code or the call
/// descriptor.
pub fn new_contract_txn(
    keypair: &Keypair,
    tx_type: TxType,
    payload: Vec<u8>,
    accumulated: i64,
    utxos: &[SpendableUtxo],
) -> Result<Transaction, Box<dyn Error>> {
    if accumulated < 1 {
        return Err("Insufficient funds: a contract transaction needs at least one spendable output".into());
    }

    let (vin, prev_txs) = build_inputs(utxos, keypair.public_key_bytes());

    let vout = vec![TxOutput {
        value: accumulated,
        pub_key_hash: keypair.address().to_vec(),
    }];

    let mut tx = Transaction {
        id: vec![],
        vin,
        vout,
        tx_type,
        payload,
    };
    tx.set_id();
    tx.sign(keypair, &prev_txs)?;

    Ok(tx)
}
