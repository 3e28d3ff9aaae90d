//! WebSocket side of the client channel.
//!
//! One socket per browser tab. The handler owns the two socket tasks
//! (reader and writer) and the bounded queues between them and the
//! multiplexer. The first text message must parse as an `init` frame;
//! anything else gets an `error` frame and the connection closes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::core::broker::Broker;
use crate::core::error::CoreError;
use crate::core::multiplexer::Multiplexer;
use crate::core::protocol::{Inbound, InitFrame, Outbound};

/// Slot bound for the inbound control-frame queue. Input frames are small;
/// a client this far ahead of the PTY is misbehaving.
const INBOUND_SLOTS: usize = 256;

/// `GET /ws`: upgrade and hand the socket to the channel loop.
pub async fn ws_handler(
    State(broker): State<Arc<Broker>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

/// Reads the mandatory first frame.
async fn read_init(stream: &mut SplitStream<WebSocket>) -> Result<InitFrame, CoreError> {
    let message = match stream.next().await {
        Some(Ok(message)) => message,
        _ => return Err(CoreError::Protocol("connection closed before init".to_string())),
    };
    let text = match message {
        Message::Text(text) => text,
        other => {
            return Err(CoreError::Protocol(format!(
                "expected a text init frame, got {other:?}"
            )))
        }
    };
    match serde_json::from_str::<Inbound>(text.as_str()) {
        Ok(Inbound::Init(init)) => Ok(init),
        Ok(other) => Err(CoreError::Protocol(format!(
            "first frame must be init, got {other:?}"
        ))),
        Err(e) => Err(CoreError::Protocol(format!("unparseable frame: {e}"))),
    }
}

async fn handle_socket(socket: WebSocket, broker: Arc<Broker>) {
    let (mut sink, mut stream) = socket.split();

    let init = match read_init(&mut stream).await {
        Ok(init) => init,
        Err(err) => {
            log::warn!("channel rejected: {err}");
            if let Ok(text) = serde_json::to_string(&Outbound::error(&err)) {
                let _ = sink.send(Message::Text(text.into())).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(broker.config().outbound_slots());
    let (in_tx, in_rx) = mpsc::channel::<Inbound>(INBOUND_SLOTS);

    // Socket writer: drains the outbound queue in order. An error frame is
    // terminal by contract, so the writer closes right after sending one.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let terminal = matches!(frame, Outbound::Error { .. });
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    log::error!("outbound frame failed to serialize: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            if terminal {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Socket reader: parses frames into the bounded inbound queue. Overflow
    // means the peer is racing far ahead of the PTY; the channel dies with
    // an overflow error rather than dropping input silently.
    let reader = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => match serde_json::from_str::<Inbound>(text.as_str()) {
                        Ok(frame) => {
                            if in_tx.try_send(frame).is_err() {
                                let err =
                                    CoreError::Overflow("inbound queue exceeded".to_string());
                                log::warn!("channel closing: {err}");
                                let _ = out_tx.try_send(Outbound::error(&err));
                                break;
                            }
                        }
                        Err(e) => {
                            let err = CoreError::Protocol(format!("unparseable frame: {e}"));
                            log::warn!("channel closing: {err}");
                            let _ = out_tx.try_send(Outbound::error(&err));
                            break;
                        }
                    },
                    Message::Close(_) => break,
                    Message::Binary(_) => {
                        let err =
                            CoreError::Protocol("binary frames are not part of the protocol".to_string());
                        let _ = out_tx.try_send(Outbound::error(&err));
                        break;
                    }
                    // Ping/pong are handled by the transport.
                    _ => {}
                }
            }
            // Dropping in_tx here tells the multiplexer the client is gone.
        })
    };

    Multiplexer::new(broker).run(init, out_tx, in_rx).await;

    // The session is over (or the task viewer detached); the remaining
    // out_tx clone is gone, so the writer drains and closes the socket.
    reader.abort();
    let _ = writer.await;
}
