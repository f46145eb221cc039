use anyhow::Result;
use clap::Parser;
use kiln_core::logging::init_tracing;
use kiln_dataset::cli::{self, DatasetArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = DatasetArgs::parse();
    init_tracing("info");

    cli::run(args).await?;
    Ok(())
}
