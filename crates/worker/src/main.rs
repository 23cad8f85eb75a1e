use clap::Parser;

use newsrelay_worker::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    newsrelay_worker::runtime::run(cli).await
}
