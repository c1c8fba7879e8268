use clap::Parser;
use tracing::info;

mod cli;
mod initializers;
mod workload;

use cli::CLI;
use initializers::init_tracing;

fn main() -> eyre::Result<()> {
    let CLI { opts } = CLI::parse();

    init_tracing(&opts)?;

    let report = workload::run(&opts)?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print();
    }

    info!("done");
    Ok(())
}
