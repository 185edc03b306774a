use std::process::exit;
use structopt::StructOpt;
use wavm::commands::run::{execute, Run};

#[derive(Debug, StructOpt)]
#[structopt(name = "wavm", about = "WebAssembly execution runtime.")]
/// The options for the wavm Command Line Interface
enum CliOptions {
    /// Run a WebAssembly file. Formats accepted: wasm, wast
    #[structopt(name = "run")]
    Run(Run),
}

fn main() {
    env_logger::init();

    let options = CliOptions::from_args();
    match options {
        CliOptions::Run(options) => exit(execute(&options)),
    }
}
