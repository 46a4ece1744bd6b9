use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConsoleError;
use crate::protocol::ChatFrame;

use super::{Connector, NORMAL_CLOSURE, WireMessage};

/// Lifecycle and content events from one transport instance.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Frame(ChatFrame),
    /// Orderly close by the peer, or the link dropping (`code: None`)
    Closed { code: Option<u16> },
    /// The dial failed
    Failed { error: String },
}

/// A [`TransportEvent`] tagged with the visitor and transport generation
/// it belongs to, so the owner can discard events from replaced instances.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportNotice {
    pub visitor_id: String,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Owning handle to a running per-conversation transport.
#[derive(Debug)]
pub struct TransportHandle {
    visitor_id: String,
    generation: u64,
    outgoing: mpsc::Sender<WireMessage>,
    cancel: CancellationToken,
}

impl TransportHandle {
    /// Dial `url` in the background and report progress on `notices`.
    pub fn open(
        connector: Arc<dyn Connector>,
        url: String,
        visitor_id: String,
        generation: u64,
        notices: mpsc::Sender<TransportNotice>,
    ) -> Self {
        let (outgoing, outgoing_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        tokio::spawn(run_transport(
            connector,
            url,
            visitor_id.clone(),
            generation,
            outgoing_rx,
            cancel.clone(),
            notices,
        ));

        Self {
            visitor_id,
            generation,
            outgoing,
            cancel,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame. At most once: a full or closed queue drops it.
    pub fn send(&self, frame: &ChatFrame) -> bool {
        let json = match frame.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(visitor = %self.visitor_id, "failed to encode frame: {}", e);
                return false;
            }
        };
        self.outgoing.try_send(WireMessage::Text(json)).is_ok()
    }

    /// Close with a normal-closure code. No further events are reported.
    pub fn close(self) {
        debug!(
            visitor = %self.visitor_id,
            generation = self.generation,
            "closing chat transport"
        );
        self.cancel.cancel();
    }
}

async fn run_transport(
    connector: Arc<dyn Connector>,
    url: String,
    visitor_id: String,
    generation: u64,
    mut outgoing_rx: mpsc::Receiver<WireMessage>,
    cancel: CancellationToken,
    notices: mpsc::Sender<TransportNotice>,
) {
    let notify = |event: TransportEvent| {
        let notices = notices.clone();
        let visitor_id = visitor_id.clone();
        async move {
            let _ = notices
                .send(TransportNotice {
                    visitor_id,
                    generation,
                    event,
                })
                .await;
        }
    };

    let link = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connector.connect(url.clone()) => result,
    };

    let mut link = match link {
        Ok(link) => link,
        Err(e) => {
            warn!(visitor = %visitor_id, url = %url, "chat transport failed to connect: {}", e);
            notify(TransportEvent::Failed {
                error: e.to_string(),
            })
            .await;
            return;
        }
    };

    info!(visitor = %visitor_id, generation, "chat transport connected");
    notify(TransportEvent::Opened).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = link.outgoing.send(WireMessage::Close(Some(NORMAL_CLOSURE))).await;
                return;
            }
            msg = outgoing_rx.recv() => {
                let Some(msg) = msg else {
                    // Handle dropped without close()
                    let _ = link.outgoing.send(WireMessage::Close(Some(NORMAL_CLOSURE))).await;
                    return;
                };
                if link.outgoing.send(msg).await.is_err() {
                    debug!(visitor = %visitor_id, "chat transport writer is gone");
                }
            }
            msg = link.incoming.recv() => {
                match msg {
                    Some(WireMessage::Text(text)) => match ChatFrame::parse(&text) {
                        Ok(frame) => notify(TransportEvent::Frame(frame)).await,
                        Err(e) => warn!(visitor = %visitor_id, "dropping undecodable frame: {}", e),
                    },
                    Some(WireMessage::Close(code)) => {
                        info!(visitor = %visitor_id, code = ?code, "chat transport closed by server");
                        notify(TransportEvent::Closed { code }).await;
                        return;
                    }
                    None => {
                        info!(visitor = %visitor_id, "chat transport dropped");
                        notify(TransportEvent::Closed { code: None }).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Open a short-lived link, send one frame, and close it normally.
///
/// Used for control frames that must reach the server even though no
/// long-lived transport exists for the conversation.
pub async fn send_once(
    connector: &dyn Connector,
    url: String,
    frame: &ChatFrame,
) -> Result<(), ConsoleError> {
    let json = frame.to_json()?;
    let link = connector.connect(url).await?;
    link.outgoing
        .send(WireMessage::Text(json))
        .await
        .map_err(|_| ConsoleError::Protocol("link closed before frame was sent".into()))?;
    let _ = link
        .outgoing
        .send(WireMessage::Close(Some(NORMAL_CLOSURE)))
        .await;
    Ok(())
}
