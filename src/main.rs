//! devdock-bridge - drive scripts under the V8 inspector from the shell
//!
//! Every command talks to a background daemon that owns the runtime, its
//! inspector connection, and the push channel for observers.

use clap::Parser;
use commands::Commands;
use devdock_bridge::{cli, commands, common::logging, daemon};

#[derive(Parser)]
#[command(name = "devdock-bridge", about = "Remote debugging bridge for script sessions")]
#[command(version, long_about = None)]
struct Cli {
    /// Session id to address (defaults to the active session)
    #[arg(long, global = true)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon => {
            let _logging = logging::init_daemon();
            daemon::run().await
        }
        command => {
            logging::init_cli();
            cli::dispatch(command, cli.session).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
