pub mod command;
pub mod commands;
pub mod v1;
pub mod vm;
pub mod wallet;
pub mod wallet_file;

use std::{env, process};

use command::dispatch_command;
use commands::top_level::make_command_map;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let command_map = make_command_map();
    let args: Vec<String> = env::args().collect();

    if !dispatch_command(&args[1..].to_vec(), &command_map, None) {
        process::exit(1);
    }
}
