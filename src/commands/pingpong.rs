//! `msgsock pingpong server|client`

use std::time::Duration;

use anyhow::{Context, Result};
use msgsock::{Client, Server};

use super::SocketOptions;

const SOCKET_PATH: &str = "/tmp/pingpong.sock";

/// How long the client waits for its pong.
const REPLY_WAIT: Duration = Duration::from_secs(1);

pub async fn server(opts: &SocketOptions) -> Result<()> {
    let server = Server::new(opts.server_config(SOCKET_PATH)?);
    server.handle("ping", |conn, _msg| async move {
        conn.send("pong", "pong").await?;
        Ok(())
    });

    server.start()?;
    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    server.stop().await?;
    Ok(())
}

pub async fn client(opts: &SocketOptions) -> Result<()> {
    let client = Client::new(opts.client_config(SOCKET_PATH)?);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    client.handle("pong", move |_client, msg| {
        let tx = tx.clone();
        async move {
            let response: String = msg.decode_payload()?;
            println!("Received from server: {response}");
            let _ = tx.send(response);
            Ok(())
        }
    });

    client.connect().await?;
    let result = async {
        client.send("ping", "ping").await.context("Failed to send ping")?;
        tokio::time::timeout(REPLY_WAIT, rx.recv())
            .await
            .context("No pong within a second")?;
        Ok(())
    }
    .await;

    client.close();
    result
}
