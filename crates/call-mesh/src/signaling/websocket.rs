//! WebSocket transport for the signaling channel

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::channel::{ChannelEvent, ChannelEvents, SignalingChannel};
use super::protocol::{InboundEvent, OutboundEvent};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Open a signaling channel over WebSocket
///
/// The bearer token is presented once in the upgrade request. `Connected`
/// is the first event delivered on success.
pub async fn connect(url: &str, auth_token: Option<&str>) -> Result<(SignalingChannel, ChannelEvents)> {
    info!("Connecting to signaling server: {}", url);

    let mut request = url
        .into_client_request()
        .map_err(|e| Error::WebSocketError(format!("Invalid signaling url: {}", e)))?;

    if let Some(token) = auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::InvalidConfig(format!("Invalid auth token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

    info!("Connected to signaling server");

    let (write, read) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Cannot fail: the receiver is still held here.
    let _ = event_tx.send(ChannelEvent::Connected);

    tokio::spawn(sender_task(write, out_rx));
    let reader = tokio::spawn(receiver_task(read, event_tx));

    Ok((SignalingChannel::new(out_tx, Some(reader)), event_rx))
}

/// Sender task: drains queued events into the socket, then closes it
async fn sender_task(
    mut write: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundEvent>,
) {
    while let Some(event) = rx.recv().await {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unserializable {}: {}", event.name(), e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(text)).await {
            error!("Failed to send WebSocket message: {}", e);
            break;
        }
    }

    if let Err(e) = write.close().await {
        debug!("WebSocket close failed: {}", e);
    }
    debug!("Sender task terminated");
}

/// Receiver task: parses frames and forwards them as channel events
async fn receiver_task(
    mut read: futures::stream::SplitStream<WsStream>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut reason = None;

    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match InboundEvent::from_json(&text) {
                Ok(Some(event)) => {
                    if events.send(ChannelEvent::Event(event)).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to handle signaling message: {}", e),
            },
            Ok(Message::Close(frame)) => {
                info!("WebSocket connection closed");
                reason = frame.map(|f| f.reason.to_string());
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                reason = Some(e.to_string());
                break;
            }
            _ => {}
        }
    }

    let _ = events.send(ChannelEvent::Disconnected(reason));
    debug!("Receiver task terminated");
}
