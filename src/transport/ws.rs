//! WebSocket transport adapter.
//!
//! Bridges an already-upgraded `tokio-tungstenite` stream into a
//! [`Transport`] endpoint. Envelopes travel as JSON text frames; HTTP
//! upgrade, TLS, and header parsing stay with the embedder, which hands
//! the extracted headers in alongside the stream.

use super::{pair, Transport, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use mremux_proto::Message;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Attach a WebSocket stream to a fresh [`Transport`] endpoint.
///
/// The returned endpoint is handed to the multiplexer; a pump task owns
/// the socket and runs until either side closes.
pub fn attach<S>(stream: WebSocketStream<S>, headers: HashMap<String, String>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut local, remote) = pair();
    for (name, value) in headers {
        local.insert_header(name, value);
    }
    tokio::spawn(pump(stream, remote));
    local
}

async fn pump<S>(stream: WebSocketStream<S>, mut side: Transport)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sender = side.sender();
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            event = side.recv() => match event {
                TransportEvent::Message(message) => match message.encode() {
                    Ok(text) => {
                        if let Err(error) = sink.send(tungstenite::Message::text(text)).await {
                            warn!(%error, "websocket write failed");
                            sender.close();
                            break;
                        }
                    }
                    Err(error) => warn!(%error, "failed to encode envelope; frame skipped"),
                },
                TransportEvent::Closed => {
                    let _ = sink.send(tungstenite::Message::Close(None)).await;
                    break;
                }
                TransportEvent::Error(reason) => {
                    warn!(%reason, "transport failed; dropping websocket");
                    break;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => match Message::decode(text.as_str()) {
                    Ok(message) => {
                        if sender.send(message).is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(%error, "ignoring unparseable frame"),
                },
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    debug!("websocket closed by peer");
                    sender.close();
                    break;
                }
                // Pings are answered by the protocol layer underneath;
                // binary frames are not part of this wire format.
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%error, "websocket read failed");
                    sender.fail(error.to_string());
                    break;
                }
            },
        }
    }
}
