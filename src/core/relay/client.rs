//! Client side of the relay connection.
//!
//! [`connect`] opens the WebSocket, waits for `your-id`, and hands back a
//! [`RelayLink`]: a typed sender for outgoing envelopes and a receiver of
//! parsed incoming ones. The incoming receiver closing means the relay is
//! gone.

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::core::protocol::signaling::RelayMessage;

pub struct RelayLink {
    pub id: String,
    pub nickname: String,
    pub outgoing: mpsc::UnboundedSender<RelayMessage>,
    pub incoming: mpsc::UnboundedReceiver<RelayMessage>,
}

pub async fn connect(url: &str) -> Result<RelayLink> {
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("connecting to relay {url}"))?;
    let (mut ws_write, mut ws_read) = ws.split();

    let (in_tx, mut incoming) = mpsc::unbounded_channel::<RelayMessage>();
    let (outgoing, mut out_rx) = mpsc::unbounded_channel::<RelayMessage>();

    tokio::spawn(async move {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(parsed) => {
                        if in_tx.send(parsed).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(event = "relay_message_unparsed", error = %e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(event = "relay_read_failure", error = %e);
                    break;
                }
            }
        }
        debug!(event = "relay_reader_closed");
    });

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!(event = "relay_encode_failure", error = %e);
                    continue;
                }
            };
            if let Err(e) = ws_write.send(Message::Text(text)).await {
                warn!(event = "relay_write_failure", error = %e);
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let (id, nickname) = loop {
        match incoming.recv().await {
            Some(RelayMessage::YourId { id, nickname }) => break (id, nickname),
            Some(other) => debug!(event = "relay_message_before_identity", kind = other.kind()),
            None => return Err(anyhow!("relay closed before assigning an identity")),
        }
    };
    info!(event = "relay_connected", url = %url, id = %id, nickname = %nickname);

    Ok(RelayLink {
        id,
        nickname,
        outgoing,
        incoming,
    })
}
