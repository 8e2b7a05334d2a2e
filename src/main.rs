use std::process::exit;

use clap::Parser;
use env_logger::Env;
use log::error;

use minibox::{execute, CLI};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = CLI::parse();

    match execute(cli) {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{:?}", e);
            exit(-1);
        }
    }
}
