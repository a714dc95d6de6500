use clap::Parser;

use rdk_fwupdater::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    rdk_fwupdater::run(cli).await
}
