//! `msgsock chat server|client --username NAME`

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use msgsock::{Client, Server};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::SocketOptions;

const SOCKET_PATH: &str = "/tmp/chat.sock";

#[derive(Serialize, Deserialize, Clone, Debug)]
struct ChatMessage {
    username: String,
    message: String,
    time: DateTime<Utc>,
}

pub async fn server(opts: &SocketOptions) -> Result<()> {
    let server = Server::new(opts.server_config(SOCKET_PATH)?);

    let hub = server.clone();
    server.handle("chat", move |conn, msg| {
        let hub = hub.clone();
        async move {
            let chat: ChatMessage = msg.decode_payload()?;
            conn.set_context("username", chat.username.clone());
            hub.broadcast("chat", &chat).await?;
            Ok(())
        }
    });

    server.start()?;
    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    server.stop().await?;
    Ok(())
}

pub async fn client(opts: &SocketOptions, username: String) -> Result<()> {
    let client = Client::new(opts.client_config(SOCKET_PATH)?);
    client.handle("chat", |_client, msg| async move {
        let chat: ChatMessage = msg.decode_payload()?;
        println!(
            "[{}] {}: {}",
            chat.time.with_timezone(&Local).format("%H:%M:%S"),
            chat.username,
            chat.message
        );
        Ok(())
    });

    client.connect_with_retry().await?;
    client.set_context("username", username.clone());
    println!("Connected to chat server. Type your messages (Ctrl+C to quit):");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let chat = ChatMessage {
            username: username.clone(),
            message: line,
            time: Utc::now(),
        };
        if let Err(e) = client.send("chat", &chat).await {
            println!("Error sending message: {e}");
            if !client.is_connected() {
                println!("Lost connection to server. Waiting for reconnection...");
            }
        }
    }

    client.close();
    Ok(())
}
