mod bridge;
mod cli;
mod config;
mod error;
mod logging;

use clap::Parser;

use cli::Cli;
use error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run().await
}
