use std::{error::Error, net::TcpStream, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::wallet::decode_address;

use super::{
    block::Block,
    request::{FindSpendableUtxosReq, GetBalanceReq, GetContractStateReq, Request},
    state::State,
    transaction::Transaction,
    txn_verify::check_structure,
    utxo::SpendableUtxo,
};

#[derive(Serialize, Deserialize, Debug)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Response {
    Ack(Ack),
    Balance(BalanceRes),
    SpendableUtxos(SpendableUtxosRes),
    ContractState(ContractStateRes),
    KnownNodes(KnownNodesRes),
    Block(Block),
    EndOfBlocks,
    Failure(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct BalanceRes {
    pub balance: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SpendableUtxosRes {
    pub accumulated: i64,
    pub utxos: Vec<SpendableUtxo>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ContractStateRes {
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct KnownNodesRes {
    pub addresses: Vec<String>,
}

pub fn handle_request(
    req: Request,
    socket: TcpStream,
    state: &Arc<State>,
) -> Result<(), Box<dyn Error>> {
    match req {
        Request::SendTransaction(tx) => handle_send_transaction(tx, socket, state),
        Request::AnnounceBlock(block) => handle_announce_block(block, socket),
        Request::GetBlocks => handle_get_blocks(socket, state),
        Request::GetKnownNodes => handle_get_known_nodes(socket, state),
        Request::GetBalance(data) => handle_get_balance(data, socket, state),
        Request::FindSpendableUtxos(data) => handle_find_spendable_utxos(data, socket, state),
        Request::GetContractState(data) => handle_get_contract_state(data, socket, state),
    }
}

/// Structural checks only; signatures are the miner's business. An accepted
/// transaction goes into the mempool in serialized form.
fn handle_send_transaction(
    tx: Transaction,
    socket: TcpStream,
    state: &Arc<State>,
) -> Result<(), Box<dyn Error>> {
    if let Err(err) = check_structure(&tx) {
        send_res(
            &Response::Ack(Ack {
                success: false,
                message: format!("Transaction rejected: {}", err),
            }),
            &socket,
        )?;
        return Ok(());
    }

    let bytes = bincode::serialize(&tx)?;
    state.mempool.add(bytes);

    info!(
        txn = %hex::encode(&tx.id),
        pending = state.mempool.len(),
        "transaction accepted into the mempool"
    );

    send_res(
        &Response::Ack(Ack {
            success: true,
            message: String::from("Transaction accepted into the mempool"),
        }),
        &socket,
    )?;

    Ok(())
}

/// Accept-and-log stub; block gossip is future work.
fn handle_announce_block(block: Block, socket: TcpStream) -> Result<(), Box<dyn Error>> {
    info!(
        hash = %hex::encode(&block.hash),
        transactions = block.transactions.len(),
        "received announced block; gossip relay is not implemented"
    );

    send_res(
        &Response::Ack(Ack {
            success: true,
            message: String::from("Block received"),
        }),
        &socket,
    )?;

    Ok(())
}

fn handle_get_blocks(socket: TcpStream, state: &Arc<State>) -> Result<(), Box<dyn Error>> {
    for block in state.chain.iter() {
        send_res(&Response::Block(block), &socket)?;
    }
    send_res(&Response::EndOfBlocks, &socket)?;

    Ok(())
}

fn handle_get_known_nodes(socket: TcpStream, state: &Arc<State>) -> Result<(), Box<dyn Error>> {
    let addresses = state.known_nodes.lock().unwrap().clone();
    send_res(&Response::KnownNodes(KnownNodesRes { addresses }), &socket)?;

    Ok(())
}

fn handle_get_balance(
    data: GetBalanceReq,
    socket: TcpStream,
    state: &Arc<State>,
) -> Result<(), Box<dyn Error>> {
    let pub_key_hash = match decode_address(&data.address) {
        Ok(hash) => hash,
        Err(err) => {
            send_res(&Response::Failure(format!("{}", err)), &socket)?;
            return Ok(());
        }
    };

    match state.utxo.balance(&pub_key_hash) {
        Ok(balance) => send_res(&Response::Balance(BalanceRes { balance }), &socket)?,
        Err(err) => send_res(&Response::Failure(format!("{}", err)), &socket)?,
    }

    Ok(())
}

fn handle_find_spendable_utxos(
    data: FindSpendableUtxosReq,
    socket: TcpStream,
    state: &Arc<State>,
) -> Result<(), Box<dyn Error>> {
    let pub_key_hash = match decode_address(&data.address) {
        Ok(hash) => hash,
        Err(err) => {
            send_res(&Response::Failure(format!("{}", err)), &socket)?;
            return Ok(());
        }
    };

    let (accumulated, utxos) = match state.utxo.find_spendable(&pub_key_hash, data.amount) {
        Ok(result) => result,
        Err(err) => {
            send_res(&Response::Failure(format!("{}", err)), &socket)?;
            return Ok(());
        }
    };

    if accumulated < data.amount {
        send_res(
            &Response::Failure(format!(
                "Insufficient funds: have {}, need {}",
                accumulated, data.amount
            )),
            &socket,
        )?;
        return Ok(());
    }

    send_res(
        &Response::SpendableUtxos(SpendableUtxosRes { accumulated, utxos }),
        &socket,
    )?;

    Ok(())
}

/// An absent key is an empty value, not an error.
fn handle_get_contract_state(
    data: GetContractStateReq,
    socket: TcpStream,
    state: &Arc<State>,
) -> Result<(), Box<dyn Error>> {
    let contract_address = match hex::decode(&data.contract_address) {
        Ok(address) => address,
        Err(_) => {
            send_res(
                &Response::Failure(format!(
                    "Contract address is not hex: {}",
                    data.contract_address
                )),
                &socket,
            )?;
            return Ok(());
        }
    };

    match state
        .chain
        .get_contract_state(&contract_address, data.key.as_bytes())
    {
        Ok(value) => {
            let value = value
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            send_res(&Response::ContractState(ContractStateRes { value }), &socket)?;
        }
        Err(err) => send_res(&Response::Failure(format!("{}", err)), &socket)?,
    }

    Ok(())
}

pub fn send_res(res: &Response, stream: &TcpStream) -> bincode::Result<()> {
    bincode::serialize_into(stream, res)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use crate::v1::chain::Chain;
    use crate::v1::net::listen_on;
    use crate::v1::request::{
        download_blocks, fetch_balance, fetch_contract_state, fetch_known_nodes,
        find_spendable_utxos, submit_transaction,
    };
    use crate::v1::transaction::{new_transfer, BLOCK_REWARD};
    use crate::wallet::{encode_address, Keypair};

    struct Node {
        addr: String,
        public_addr: String,
        state: Arc<State>,
        genesis_keypair: Keypair,
        genesis_address: String,
        _dir: tempfile::TempDir,
    }

    fn start_node() -> Node {
        let dir = tempfile::tempdir().unwrap();
        let keypair = Keypair::generate();
        let address = encode_address(&keypair.public_key_bytes());

        let chain = Arc::new(Chain::init(&address, dir.path().to_str().unwrap()).unwrap());
        let state = Arc::new(State::new(chain));
        state.utxo.reindex().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let node_state = Arc::clone(&state);
        thread::spawn(move || {
            let _ = listen_on(listener, node_state, false);
        });

        let public_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let public_addr = public_listener.local_addr().unwrap().to_string();
        let public_state = Arc::clone(&state);
        thread::spawn(move || {
            let _ = listen_on(public_listener, public_state, true);
        });

        Node {
            addr,
            public_addr,
            state,
            genesis_keypair: keypair,
            genesis_address: address,
            _dir: dir,
        }
    }

    #[test]
    fn balance_query_over_the_wire() {
        let node = start_node();

        let balance = fetch_balance(&node.addr, &node.genesis_address).unwrap();
        assert_eq!(balance, BLOCK_REWARD);

        assert!(fetch_balance(&node.addr, "not-an-address").is_err());
    }

    #[test]
    fn submitted_transaction_lands_in_the_mempool() {
        let node = start_node();
        let recipient = encode_address(&Keypair::generate().public_key_bytes());

        let (accumulated, utxos) =
            find_spendable_utxos(&node.addr, &node.genesis_address, 40).unwrap();
        let tx = new_transfer(&node.genesis_keypair, &recipient, 40, accumulated, &utxos).unwrap();

        let ack = submit_transaction(&node.addr, &tx).unwrap();
        assert!(ack.success);
        assert_eq!(node.state.mempool.len(), 1);

        // Submitting the identical transaction again is a no-op.
        submit_transaction(&node.addr, &tx).unwrap();
        assert_eq!(node.state.mempool.len(), 1);
    }

    #[test]
    fn structurally_broken_transactions_are_refused() {
        let node = start_node();
        let genesis_txn = node.state.chain.iter().next().unwrap().transactions[0].clone();

        // A coinbase from the outside world has no business in the mempool.
        assert!(submit_transaction(&node.addr, &genesis_txn).is_err());
        assert!(node.state.mempool.is_empty());
    }

    #[test]
    fn insufficient_funds_is_an_error() {
        let node = start_node();

        let result = find_spendable_utxos(&node.addr, &node.genesis_address, BLOCK_REWARD + 1);
        assert!(result.is_err());
    }

    #[test]
    fn block_stream_runs_tip_to_genesis() {
        let node = start_node();

        let blocks = download_blocks(&node.addr).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert_eq!(blocks[0].hash, node.state.chain.last_hash());
    }

    #[test]
    fn absent_contract_state_is_an_empty_string() {
        let node = start_node();

        let value = fetch_contract_state(&node.addr, &hex::encode([0x11; 32]), "key").unwrap();
        assert_eq!(value, "");

        assert!(fetch_contract_state(&node.addr, "zz-not-hex", "key").is_err());
    }

    #[test]
    fn known_nodes_defaults_to_empty() {
        let node = start_node();

        assert!(fetch_known_nodes(&node.addr).unwrap().is_empty());
    }

    #[test]
    fn public_service_exposes_only_the_public_subset() {
        let node = start_node();

        // Queries in the public subset work.
        let balance = fetch_balance(&node.public_addr, &node.genesis_address).unwrap();
        assert_eq!(balance, BLOCK_REWARD);

        // The block stream does not.
        assert!(download_blocks(&node.public_addr).is_err());
        assert!(fetch_known_nodes(&node.public_addr).is_err());
    }
}
