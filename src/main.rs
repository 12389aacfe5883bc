//! msgsock demo CLI - small programs exercising the `msgsock` library.
//!
//! Each subcommand runs either side of a conversation over a Unix socket:
//! `pingpong` is a single request/response, `chat` broadcasts every line a
//! client types to all connected clients.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "msgsock")]
#[command(version)]
#[command(about = "JSON messaging over Unix domain sockets")]
struct Cli {
    /// JSON config file (server or client, depending on the subcommand)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer "ping" with "pong", or send one ping and print the reply
    Pingpong {
        #[command(subcommand)]
        role: PingpongRole,
    },
    /// Broadcast chat server, or an interactive chat client
    Chat {
        #[command(subcommand)]
        role: ChatRole,
    },
}

#[derive(Subcommand)]
enum PingpongRole {
    Server,
    Client,
}

#[derive(Subcommand)]
enum ChatRole {
    Server,
    Client {
        /// Name shown next to your messages
        #[arg(long)]
        username: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    msgsock::init_logging("info");

    let cli = Cli::parse();
    let opts = commands::SocketOptions {
        config: cli.config,
        socket: cli.socket,
    };

    match cli.command {
        Commands::Pingpong { role } => match role {
            PingpongRole::Server => commands::pingpong::server(&opts).await,
            PingpongRole::Client => commands::pingpong::client(&opts).await,
        },
        Commands::Chat { role } => match role {
            ChatRole::Server => commands::chat::server(&opts).await,
            ChatRole::Client { username } => commands::chat::client(&opts, username).await,
        },
    }
}
