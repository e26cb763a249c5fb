use anyhow::Result;
use clap::Parser;

mod cli;
mod collect;
mod core;
mod helpers;
mod process;

use cli::Cli;
use collect::Session;
use helpers::logger::Logger;

fn main() -> Result<()> {
    let config = Cli::parse().into_config()?;

    Logger::init(config.log_level)?;

    Session::new(config).run()
}
