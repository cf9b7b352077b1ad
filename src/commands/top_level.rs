use std::{
    collections::HashMap,
    error::Error,
    fs,
    sync::{mpsc, Arc},
    thread,
};

use thread_priority::{ThreadBuilderExt, ThreadPriority};
use tracing::info;

use crate::{
    command::{Command, CommandInvocation, CommandMap, Field, VarField},
    v1::{
        chain::{Chain, DB_PATH},
        miner::start_miner,
        net::listen,
        request::{fetch_balance, fetch_contract_state, find_spendable_utxos, submit_transaction},
        state::State,
        transaction::{new_contract_txn, new_transfer, TxType},
        utxo::UtxoSet,
    },
    vm::payload::make_call_payload,
    wallet::{validate_address, Keypair},
    wallet_file::{WalletFile, WALLET_DIR},
};

/// Reads the wallet password, preferring an explicit `--password=` argument
/// and falling back to a no-echo terminal prompt.
fn read_wallet_password(
    invocation: &CommandInvocation,
    confirm: bool,
) -> Result<String, Box<dyn Error>> {
    if let Some(password) = invocation.get_optional("password") {
        return Ok(password);
    }

    let password = rpassword::prompt_password("Wallet password: ")?;

    if confirm {
        let again = rpassword::prompt_password("Confirm password: ")?;
        if password != again {
            return Err("Passwords do not match".into());
        }
    }

    Ok(password)
}

fn load_keypair(
    invocation: &CommandInvocation,
    address: &str,
) -> Result<Keypair, Box<dyn Error>> {
    let wallet_file = WalletFile::load(address)?;
    let password = read_wallet_password(invocation, false)?;

    Ok(wallet_file.decrypt(&password)?)
}

fn data_dir(invocation: &CommandInvocation) -> String {
    invocation
        .get_optional("data-dir")
        .unwrap_or_else(|| DB_PATH.to_owned())
}

fn init_chain(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let address = invocation.get_field("address").unwrap();

    if !validate_address(&address) {
        return Err(format!("Invalid address: {}", address).into());
    }

    let chain = Arc::new(Chain::init(&address, &data_dir(invocation))?);
    let utxo = UtxoSet::new(Arc::clone(&chain));
    utxo.reindex()?;

    println!("Blockchain initialized.");
    println!("Tip: {}", hex::encode(chain.last_hash()));

    Ok(())
}

fn create_wallet(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let password = read_wallet_password(invocation, true)?;

    let keypair = Keypair::generate();
    let wallet_file = WalletFile::create(&keypair, &password)?;
    wallet_file.save()?;

    println!(
        "Created new wallet and saved it to {}/{}.json. Protect this file!",
        WALLET_DIR, wallet_file.address
    );
    println!("Your address is {}", wallet_file.address);

    Ok(())
}

fn balance(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let address = invocation.get_field("address").unwrap();
    let node = invocation.get_field("node").unwrap();

    if !validate_address(&address) {
        return Err(format!("Invalid address: {}", address).into());
    }

    let balance = fetch_balance(&node, &address)?;
    println!("Balance of {}: {}", address, balance);

    Ok(())
}

fn send(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let from = invocation.get_field("from").unwrap();
    let to = invocation.get_field("to").unwrap();
    let amount: i64 = invocation.get_field("amount").unwrap().parse()?;
    let node = invocation.get_field("node").unwrap();

    if !validate_address(&from) {
        return Err(format!("Invalid address: {}", from).into());
    }
    if !validate_address(&to) {
        return Err(format!("Invalid address: {}", to).into());
    }
    if amount <= 0 {
        return Err("Amount must be positive".into());
    }

    let keypair = load_keypair(invocation, &from)?;

    let (accumulated, utxos) = find_spendable_utxos(&node, &from, amount)?;
    let tx = new_transfer(&keypair, &to, amount, accumulated, &utxos)?;

    let ack = submit_transaction(&node, &tx)?;
    println!("Sent transaction {}", hex::encode(&tx.id));
    println!("Node: {}", ack.message);

    Ok(())
}

fn deploy(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let from = invocation.get_field("from").unwrap();
    let file = invocation.get_field("file").unwrap();
    let node = invocation.get_field("node").unwrap();

    if !validate_address(&from) {
        return Err(format!("Invalid address: {}", from).into());
    }

    let code = fs::read(&file).map_err(|err| format!("Cannot read {}: {}", file, err))?;
    let keypair = load_keypair(invocation, &from)?;

    let (accumulated, utxos) = find_spendable_utxos(&node, &from, 1)?;
    let tx = new_contract_txn(&keypair, TxType::ContractDeploy, code, accumulated, &utxos)?;

    let ack = submit_transaction(&node, &tx)?;
    println!("Sent deploy transaction {}", hex::encode(&tx.id));
    println!("Contract address will be {}", hex::encode(&tx.id));
    println!("Node: {}", ack.message);

    Ok(())
}

fn call(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let from = invocation.get_field("from").unwrap();
    let contract = invocation.get_field("contract").unwrap();
    let function = invocation.get_field("function").unwrap();
    let node = invocation.get_field("node").unwrap();
    let args_raw = invocation
        .get_optional("args")
        .unwrap_or_else(|| String::from("[]"));

    if !validate_address(&from) {
        return Err(format!("Invalid address: {}", from).into());
    }

    let args: Vec<serde_json::Value> = serde_json::from_str(&args_raw)
        .map_err(|err| format!("--args must be a JSON array: {}", err))?;

    let payload = make_call_payload(&contract, &function, args)?;
    let keypair = load_keypair(invocation, &from)?;

    let (accumulated, utxos) = find_spendable_utxos(&node, &from, 1)?;
    let tx = new_contract_txn(&keypair, TxType::ContractCall, payload, accumulated, &utxos)?;

    let ack = submit_transaction(&node, &tx)?;
    println!("Sent call transaction {}", hex::encode(&tx.id));
    println!("Node: {}", ack.message);

    Ok(())
}

fn read_state(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let contract = invocation.get_field("contract").unwrap();
    let key = invocation.get_field("key").unwrap();
    let node = invocation.get_field("node").unwrap();

    let value = fetch_contract_state(&node, &contract, &key)?;
    println!("{}", value);

    Ok(())
}

fn start(invocation: &CommandInvocation, _state: Option<()>) -> Result<(), Box<dyn Error>> {
    let port: u16 = invocation.get_field("port").unwrap().parse()?;
    let public_port: u16 = invocation.get_field("grpcport").unwrap().parse()?;
    let miner = invocation.get_optional("miner");

    let chain = Arc::new(Chain::open(&data_dir(invocation))?);
    let state = Arc::new(State::new(chain));
    state.utxo.reindex()?;

    info!(tip = %hex::encode(state.chain.last_hash()), "blockchain loaded");

    // The sender half has to stay alive for the whole run; dropping it would
    // tell the miner to stop.
    let mut _miner_shutdown: Option<mpsc::Sender<()>> = None;

    if let Some(miner_address) = miner {
        if !validate_address(&miner_address) {
            return Err(format!("Invalid miner address: {}", miner_address).into());
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        _miner_shutdown = Some(shutdown_tx);

        let miner_state = Arc::clone(&state);
        thread::Builder::new()
            .name(String::from("miner"))
            .spawn_with_priority(ThreadPriority::Max, move |_| {
                start_miner(&miner_state, shutdown_rx, &miner_address);
            })
            .unwrap();
    }

    let public_state = Arc::clone(&state);
    let public_addr = format!("0.0.0.0:{}", public_port);
    thread::Builder::new()
        .name(String::from("public-listener"))
        .spawn(move || {
            listen(&public_addr, public_state, true).expect("Public listener crashed");
        })
        .unwrap();

    listen(&format!("0.0.0.0:{}", port), state, false)
}

pub fn make_command_map() -> CommandMap<()> {
    let mut out: CommandMap<()> = HashMap::new();

    let init_cmd: Command<()> = Command {
        processor: init_chain,
        expected_fields: vec![Field::new(
            "address",
            "Address that receives the genesis reward",
        )],
        optionals: vec![VarField::new(
            "data-dir",
            "Location of the block store (default ./tmp/blocks)",
        )],
        desc: String::from("Create the blockchain with a genesis block paying the given address"),
    };

    let create_wallet_cmd: Command<()> = Command {
        processor: create_wallet,
        expected_fields: vec![],
        optionals: vec![VarField::new(
            "password",
            "Wallet password. If not given, it is prompted for without echo",
        )],
        desc: String::from(
            "Create a keypair, encrypt it with a password and save it under wallets/",
        ),
    };

    let balance_cmd: Command<()> = Command {
        processor: balance,
        expected_fields: vec![
            Field::new("address", "Address to query"),
            Field::new("node", "Node to ask, as host:port"),
        ],
        optionals: vec![],
        desc: String::from("Ask a node for the spendable balance of an address"),
    };

    let send_cmd: Command<()> = Command {
        processor: send,
        expected_fields: vec![
            Field::new("from", "Sender address (must have a wallet file)"),
            Field::new("to", "Recipient address"),
            Field::new("amount", "Amount to send"),
            Field::new("node", "Node to submit to, as host:port"),
        ],
        optionals: vec![VarField::new(
            "password",
            "Wallet password. If not given, it is prompted for without echo",
        )],
        desc: String::from("Build, sign and submit a transfer"),
    };

    let deploy_cmd: Command<()> = Command {
        processor: deploy,
        expected_fields: vec![
            Field::new("from", "Deployer address (must have a wallet file)"),
            Field::new("file", "Path to the contract source file"),
            Field::new("node", "Node to submit to, as host:port"),
        ],
        optionals: vec![VarField::new(
            "password",
            "Wallet password. If not given, it is prompted for without echo",
        )],
        desc: String::from(
            "Deploy a contract. The contract address is the deploy transaction id",
        ),
    };

    let call_cmd: Command<()> = Command {
        processor: call,
        expected_fields: vec![
            Field::new("from", "Caller address (must have a wallet file)"),
            Field::new("contract", "Contract address in hex"),
            Field::new("function", "Contract function to invoke"),
            Field::new("node", "Node to submit to, as host:port"),
        ],
        optionals: vec![
            VarField::new("args", "Call arguments as a JSON array (default [])"),
            VarField::new(
                "password",
                "Wallet password. If not given, it is prompted for without echo",
            ),
        ],
        desc: String::from("Invoke a function of a deployed contract"),
    };

    let read_cmd: Command<()> = Command {
        processor: read_state,
        expected_fields: vec![
            Field::new("contract", "Contract address in hex"),
            Field::new("key", "State key to read"),
            Field::new("node", "Node to ask, as host:port"),
        ],
        optionals: vec![],
        desc: String::from("Read a contract state value. Prints an empty line if the key is unset"),
    };

    let start_cmd: Command<()> = Command {
        processor: start,
        expected_fields: vec![
            Field::new("port", "Port for the node service"),
            Field::new("grpcport", "Port for the public (browser) service"),
        ],
        optionals: vec![
            VarField::new("miner", "Mine in the background, sending rewards to this address"),
            VarField::new("data-dir", "Location of the block store (default ./tmp/blocks)"),
        ],
        desc: String::from(
            "Start a node: open the chain, reindex the UTXO set and serve requests",
        ),
    };

    out.insert(String::from("init"), init_cmd);
    out.insert(String::from("createwallet"), create_wallet_cmd);
    out.insert(String::from("balance"), balance_cmd);
    out.insert(String::from("send"), send_cmd);
    out.insert(String::from("deploy"), deploy_cmd);
    out.insert(String::from("call"), call_cmd);
    out.insert(String::from("read"), read_cmd);
    out.insert(String::from("start"), start_cmd);

    out
}
