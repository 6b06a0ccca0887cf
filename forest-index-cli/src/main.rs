#![deny(unused_must_use)]

mod cli;
mod commands;

use crate::cli::{Command, ForestIndexOptions};
use anyhow::Result;
use clap::Parser;
use human_panic::setup_panic;
pub use forest_index_common as common;

fn main() -> Result<()> {
    // panic handler
    setup_panic!();

    let args = ForestIndexOptions::parse();

    // logger
    // unwrap: will only fail if the logger is already initialized, which it clearly is not
    simple_logger::init_with_level(args.log_level).unwrap();

    match args.command {
        Command::Init(options) => commands::init::run(options),
        Command::Build(options) => commands::build::run(options),
        Command::Query(options) => commands::query::run(options),
    }
}
