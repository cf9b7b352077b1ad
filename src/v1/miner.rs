use std::{
    collections::HashSet,
    error::Error,
    sync::{
        atomic::Ordering,
        mpsc::{Receiver, RecvTimeoutError},
        Arc, Mutex,
    },
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::vm::{payload::parse_call_payload, Vm, VmContext, VmError};

use super::{
    block::Block,
    chain::ContractStaging,
    state::State,
    transaction::{new_coinbase, sender_pub_key_hash, Transaction, TxType, BLOCK_REWARD},
    txn_verify::verify_transaction,
};

/// How often the miner drains the mempool.
pub const MINING_INTERVAL: Duration = Duration::from_secs(10);

/// Runs mining passes until the shutdown channel fires. The channel doubles
/// as the tick: `recv_timeout` sleeps the interval but wakes immediately on
/// shutdown.
pub fn start_miner(state: &Arc<State>, shutdown: Receiver<()>, miner_address: &str) {
    info!(miner = miner_address, "miner started");

    loop {
        match shutdown.recv_timeout(MINING_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => (),
        }

        if state.shutdown.load(Ordering::Relaxed) {
            break;
        }

        if let Err(err) = mine_once(state, miner_address) {
            warn!(error = %err, "mining pass aborted; retrying next tick");
        }
    }

    info!("miner stopped");
}

/// One pass: drain the mempool, validate and execute everything, assemble a
/// block over the survivors, commit, reconcile the mempool. Every processed
/// member is removed whether it made it into the block or not.
pub fn mine_once(state: &Arc<State>, miner_address: &str) -> Result<(), Box<dyn Error>> {
    let members = state.mempool.members();
    if members.is_empty() {
        debug!("mempool is empty; nothing to mine");
        return Ok(());
    }

    info!(pending = members.len(), "mining pass over the mempool");

    let staging = Arc::new(Mutex::new(ContractStaging::default()));
    let mut processed: Vec<Vec<u8>> = Vec::with_capacity(members.len());
    let mut valid: Vec<Transaction> = vec![];
    let mut spent_in_pass: HashSet<(Vec<u8>, i32)> = HashSet::new();

    for raw in members {
        processed.push(raw.clone());

        let tx: Transaction = match bincode::deserialize(&raw) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(error = %err, "dropping undecodable mempool member");
                continue;
            }
        };

        if let Err(err) = verify_transaction(&tx, &state.chain, &state.utxo, &spent_in_pass) {
            warn!(txn = %hex::encode(&tx.id), error = %err, "dropping invalid transaction");
            continue;
        }

        let accepted = match tx.tx_type {
            TxType::Transfer => true,
            TxType::ContractDeploy => match execute_deploy(state, &staging, &tx) {
                Ok(()) => true,
                Err(err) => {
                    warn!(txn = %hex::encode(&tx.id), error = %err, "contract deploy failed; dropping");
                    false
                }
            },
            TxType::ContractCall => match execute_call(state, &staging, &tx) {
                Ok(()) => true,
                Err(err) => {
                    warn!(txn = %hex::encode(&tx.id), error = %err, "contract call failed; dropping");
                    false
                }
            },
        };

        if accepted {
            for input in &tx.vin {
                spent_in_pass.insert((input.tx_id.clone(), input.vout_index));
            }
            valid.push(tx);
        }
    }

    if valid.is_empty() {
        // Rejected members still have to go, or they would be re-examined
        // forever.
        state.mempool.remove_many(&processed);
        info!(
            rejected = processed.len(),
            "no valid transactions; skipping block production"
        );
        return Ok(());
    }

    let coinbase = new_coinbase(miner_address, BLOCK_REWARD)?;
    let mut transactions = vec![coinbase];
    transactions.append(&mut valid);

    let block = match Block::new(state.chain.last_hash(), transactions, &state.shutdown) {
        Some(block) => block,
        None => {
            info!("proof-of-work cancelled; leaving the mempool untouched");
            return Ok(());
        }
    };

    let staging = staging.lock().unwrap();
    state.chain.append_block(&block, &staging)?;
    state.utxo.update(&block)?;
    state.mempool.remove_many(&processed);

    info!(
        hash = %hex::encode(&block.hash),
        transactions = block.transactions.len(),
        nonce = block.nonce,
        "mined new block"
    );

    Ok(())
}

/// Runs the deploy payload on a fresh VM. On success the code is staged
/// under the transaction id; on failure every write staged during the
/// attempt is rolled back.
fn execute_deploy(
    state: &Arc<State>,
    staging: &Arc<Mutex<ContractStaging>>,
    tx: &Transaction,
) -> Result<(), Box<dyn Error>> {
    let sender = sender_pub_key_hash(tx).unwrap_or_default();
    let checkpoint = staging.lock().unwrap().clone();

    let result: Result<(), VmError> = (|| {
        let vm = Vm::new()?;
        vm.set_context(VmContext {
            chain: Arc::clone(&state.chain),
            staging: Arc::clone(staging),
            contract_address: tx.id.clone(),
            sender,
        });
        vm.run_deploy(&tx.payload)
    })();

    match result {
        Ok(()) => {
            staging
                .lock()
                .unwrap()
                .stage_code(tx.id.clone(), tx.payload.clone());
            Ok(())
        }
        Err(err) => {
            *staging.lock().unwrap() = checkpoint;
            Err(err.into())
        }
    }
}

/// Resolves the target contract (staged code from earlier in this pass wins
/// over committed code), then invokes the named function. Failed calls roll
/// back their staged writes.
fn execute_call(
    state: &Arc<State>,
    staging: &Arc<Mutex<ContractStaging>>,
    tx: &Transaction,
) -> Result<(), Box<dyn Error>> {
    let payload = parse_call_payload(&tx.payload)?;
    let contract_address = hex::decode(&payload.contract_address)
        .map_err(|_| format!("contract address is not hex: {}", payload.contract_address))?;

    let staged_code = {
        let staging = staging.lock().unwrap();
        staging.staged_code(&contract_address).cloned()
    };
    let code = match staged_code {
        Some(code) => code,
        None => state
            .chain
            .get_contract_code(&contract_address)?
            .ok_or_else(|| format!("unknown contract {}", payload.contract_address))?,
    };

    let sender = sender_pub_key_hash(tx).unwrap_or_default();
    let checkpoint = staging.lock().unwrap().clone();

    let result: Result<(), VmError> = (|| {
        let vm = Vm::new()?;
        vm.set_context(VmContext {
            chain: Arc::clone(&state.chain),
            staging: Arc::clone(staging),
            contract_address,
            sender,
        });
        vm.run_call(&code, &payload.function_name, &payload.args)
    })();

    if let Err(err) = result {
        *staging.lock().unwrap() = checkpoint;
        return Err(err.into());
    }

    Ok(())
}
