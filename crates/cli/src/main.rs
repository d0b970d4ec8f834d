// notelens CLI entry point.

use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "notelens", about = "Keep a local vault in sync with the notelens service")]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::run(cli.command).await
}
