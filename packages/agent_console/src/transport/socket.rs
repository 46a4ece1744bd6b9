use futures::future::{BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use crate::error::ConsoleError;

use super::{Connector, FrameLink, WireMessage};

/// Channel depth between the socket pumps and the link owner.
const LINK_CAPACITY: usize = 64;

/// Production connector: plain or TLS WebSocket via tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<FrameLink, ConsoleError>> {
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(ConsoleError::from_tungstenite)?;
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(LINK_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<WireMessage>(LINK_CAPACITY);

            // Writer: drain link → socket. A Close ends the writer.
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    match msg {
                        WireMessage::Text(text) => {
                            if ws_write
                                .send(tungstenite::Message::Text(text.into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        WireMessage::Close(code) => {
                            let frame = code.map(|code| CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            });
                            let _ = ws_write.send(tungstenite::Message::Close(frame)).await;
                            break;
                        }
                    }
                }
                let _ = ws_write.close().await;
            });

            // Reader: socket → link. Dropping `in_tx` signals the loss.
            let reader_url = url.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_read.next().await {
                    match msg {
                        Ok(tungstenite::Message::Text(text)) => {
                            if in_tx
                                .send(WireMessage::Text(text.as_str().to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(tungstenite::Message::Close(frame)) => {
                            let code = frame.map(|f| u16::from(f.code));
                            let _ = in_tx.send(WireMessage::Close(code)).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(url = %reader_url, "websocket read error: {}", e);
                            break;
                        }
                    }
                }
            });

            Ok(FrameLink {
                outgoing: out_tx,
                incoming: in_rx,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        // Port 1 is reserved and nothing listens on it
        let result = WsConnector::new()
            .connect("ws://127.0.0.1:1/ws/chat/S1/A1".to_string())
            .await;
        assert!(matches!(result, Err(ConsoleError::Unavailable)));
    }
}
