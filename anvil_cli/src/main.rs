use std::fs;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

/// Runs an already-linked anvil bytecode text file.
#[derive(Parser)]
struct Opts {
    /// Path to a text-assembled bytecode program.
    path: String,
}

fn main() -> ExitCode {
    env_logger::init();

    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&opts) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(opts: &Opts) -> Result<ExitCode> {
    let text = fs::read_to_string(&opts.path)
        .with_context(|| format!("reading '{}'", opts.path))?;

    let executable =
        anvil_core::asm::parse(&text).map_err(|e| anyhow::anyhow!("assembling '{}': {}", opts.path, e))?;
    let direct = anvil_core::preprocess(&executable);

    let state = anvil_core::run(&direct)
        .map_err(|e| anyhow::anyhow!("running '{}': {}", opts.path, e))?;

    println!("{}", state.ret_value() as i64);

    Ok(ExitCode::SUCCESS)
}
