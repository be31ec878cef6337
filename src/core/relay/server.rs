//! WebSocket front-end of the relay.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::RelayHub;
use crate::utils::sos::SignalOfStop;

/// Bind `addr` and serve until `sos` fires.
pub async fn run(addr: &str, sos: SignalOfStop) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding relay to {addr}"))?;
    info!(event = "relay_listening", addr = %listener.local_addr()?);
    serve(listener, Arc::new(RelayHub::new()), sos).await
}

pub async fn serve(listener: TcpListener, hub: Arc<RelayHub>, sos: SignalOfStop) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = sos.wait() => {
                info!(event = "relay_stopping");
                return Ok(());
            }
            accepted = listener.accept() => accepted.context("accepting relay connection")?,
        };
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, hub).await {
                warn!(event = "relay_connection_error", peer = %peer, error = %e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: Arc<RelayHub>) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket handshake")?;
    let (mut ws_write, mut ws_read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let me = hub.connect(tx).await;
    debug!(event = "relay_session_open", peer = %peer, id = %me.id);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_write.send(Message::Text(text)).await {
                debug!(event = "relay_write_failure", error = %e);
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    while let Some(msg) = ws_read.next().await {
        match msg {
            Ok(Message::Text(text)) => hub.handle_message(&me.id, &text).await,
            Ok(Message::Binary(data)) => {
                warn!(event = "relay_binary_ignored", id = %me.id, len = data.len());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(event = "relay_read_failure", id = %me.id, error = %e);
                break;
            }
        }
    }

    hub.disconnect(&me.id).await;
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::signaling::RelayMessage;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn next_message<S>(read: &mut S) -> RelayMessage
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), read.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn websocket_clients_get_identity_then_presence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sos = SignalOfStop::new();
        let server = tokio::spawn(serve(listener, Arc::new(RelayHub::new()), sos.clone()));

        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (_write, mut read) = ws.split();
        let id = match next_message(&mut read).await {
            RelayMessage::YourId { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        };
        match next_message(&mut read).await {
            RelayMessage::Users { users } => assert_eq!(users[0].id, id),
            other => panic!("unexpected {other:?}"),
        }

        sos.cancel();
        server.await.unwrap().unwrap();
    }
}
