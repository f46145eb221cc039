use anyhow::Result;
use clap::Parser;
use kiln_cli::GenerateArgs;
use kiln_core::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = GenerateArgs::parse();
    init_tracing("info");

    kiln_cli::run(&args).await?;
    Ok(())
}
