// CLI subcommands.

use clap::Subcommand;

mod listen;
mod login;
mod note;
mod status;
mod sync;

#[derive(Subcommand)]
pub enum Command {
    /// Store an access key and enable automatic sync.
    Login {
        /// Access key issued by the notelens web app.
        access_key: String,
    },
    /// Run one reconciliation pass against the remote service.
    Sync,
    /// Run the realtime listener in the foreground.
    Listen,
    /// Generate a note from an image and print it.
    Note {
        /// Path to the image file.
        image: std::path::PathBuf,
    },
    /// Show account and sync status.
    Status,
}

pub async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login { access_key } => login::run(access_key).await,
        Command::Sync => sync::run().await,
        Command::Listen => listen::run().await,
        Command::Note { image } => note::run(image).await,
        Command::Status => status::run().await,
    }
}
