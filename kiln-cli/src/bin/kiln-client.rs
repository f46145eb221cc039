use anyhow::Result;
use clap::Parser;
use kiln_cli::{client, ClientArgs};
use kiln_core::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    init_tracing("warn");

    client::run(args).await
}
