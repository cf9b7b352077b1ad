use std::{error::Error, net::TcpStream};

use serde::{Deserialize, Serialize};

use super::{
    block::Block,
    response::{Ack, Response},
    transaction::Transaction,
    utxo::SpendableUtxo,
};

#[derive(Serialize, Deserialize, Debug)]
pub enum Request {
    SendTransaction(Transaction),
    AnnounceBlock(Block),
    GetBlocks,
    GetKnownNodes,
    GetBalance(GetBalanceReq),
    FindSpendableUtxos(FindSpendableUtxosReq),
    GetContractState(GetContractStateReq),
}

impl Request {
    /// The subset a browser-facing node exposes.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Request::SendTransaction(_)
                | Request::GetBalance(_)
                | Request::FindSpendableUtxos(_)
                | Request::GetContractState(_)
        )
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetBalanceReq {
    pub address: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct FindSpendableUtxosReq {
    pub address: String,
    pub amount: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GetContractStateReq {
    /// Hex of the deploy transaction id.
    pub contract_address: String,
    pub key: String,
}

pub fn send_req(req: &Request, addr: &str) -> bincode::Result<Response> {
    let socket = TcpStream::connect(addr)?;
    socket.set_nodelay(true).unwrap();
    bincode::serialize_into(&socket, req)?;

    let res: Response = bincode::deserialize_from(&socket)?;

    Ok(res)
}

pub fn submit_transaction(node: &str, tx: &Transaction) -> Result<Ack, Box<dyn Error>> {
    match send_req(&Request::SendTransaction(tx.clone()), node)? {
        Response::Ack(ack) if ack.success => Ok(ack),
        Response::Ack(ack) => Err(ack.message.into()),
        Response::Failure(msg) => Err(msg.into()),
        _ => Err("Node responded with nonsense".into()),
    }
}

pub fn fetch_balance(node: &str, address: &str) -> Result<i64, Box<dyn Error>> {
    let req = Request::GetBalance(GetBalanceReq {
        address: address.to_owned(),
    });

    match send_req(&req, node)? {
        Response::Balance(data) => Ok(data.balance),
        Response::Failure(msg) => Err(msg.into()),
        _ => Err("Node responded with nonsense".into()),
    }
}

pub fn find_spendable_utxos(
    node: &str,
    address: &str,
    amount: i64,
) -> Result<(i64, Vec<SpendableUtxo>), Box<dyn Error>> {
    let req = Request::FindSpendableUtxos(FindSpendableUtxosReq {
        address: address.to_owned(),
        amount,
    });

    match send_req(&req, node)? {
        Response::SpendableUtxos(data) => Ok((data.accumulated, data.utxos)),
        Response::Failure(msg) => Err(msg.into()),
        _ => Err("Node responded with nonsense".into()),
    }
}

pub fn fetch_contract_state(
    node: &str,
    contract_address: &str,
    key: &str,
) -> Result<String, Box<dyn Error>> {
    let req = Request::GetContractState(GetContractStateReq {
        contract_address: contract_address.to_owned(),
        key: key.to_owned(),
    });

    match send_req(&req, node)? {
        Response::ContractState(data) => Ok(data.value),
        Response::Failure(msg) => Err(msg.into()),
        _ => Err("Node responded with nonsense".into()),
    }
}

pub fn fetch_known_nodes(node: &str) -> Result<Vec<String>, Box<dyn Error>> {
    match send_req(&Request::GetKnownNodes, node)? {
        Response::KnownNodes(data) => Ok(data.addresses),
        Response::Failure(msg) => Err(msg.into()),
        _ => Err("Node responded with nonsense".into()),
    }
}

pub fn announce_block(node: &str, block: &Block) -> Result<Ack, Box<dyn Error>> {
    match send_req(&Request::AnnounceBlock(block.clone()), node)? {
        Response::Ack(ack) => Ok(ack),
        Response::Failure(msg) => Err(msg.into()),
        _ => Err("Node responded with nonsense".into()),
    }
}

/// Streams the whole chain, tip to genesis. Block frames arrive one by one
/// on the same connection, closed off by an end marker.
pub fn download_blocks(node: &str) -> Result<Vec<Block>, Box<dyn Error>> {
    let socket = TcpStream::connect(node)?;
    socket.set_nodelay(true).unwrap();
    bincode::serialize_into(&socket, &Request::GetBlocks)?;

    let mut blocks: Vec<Block> = vec![];
    loop {
        match bincode::deserialize_from(&socket)? {
            Response::Block(block) => blocks.push(block),
            Response::EndOfBlocks => break,
            Response::Failure(msg) => return Err(msg.into()),
            _ => return Err("Node responded with nonsense".into()),
        }
    }

    Ok(blocks)
}
