//! Notification channel: the agent's shared server-push connection.
//!
//! One connection per agent identity, shared by every consumer that needs
//! to hear about new and assigned visitors. Consumers register listeners;
//! the connection is torn down a grace period after the last one leaves.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::notification_url;
use crate::protocol::NotificationEvent;
use crate::transport::{Connector, NORMAL_CLOSURE, WireMessage};

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
}

/// Shared notification connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct NotificationChannel {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    backoff: Duration,
    grace: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    agent_id: Option<String>,
    url: Option<String>,
    state: ChannelState,
    /// Bumped on every new attempt; stale tasks compare and bail.
    generation: u64,
    connection: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
    teardown: Option<CancellationToken>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: ListenerId,
}

impl Inner {
    /// Cancel the live connection and any pending reconnect.
    fn stop(&mut self) {
        if let Some(cancel) = self.connection.take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.reconnect.take() {
            cancel.cancel();
        }
        self.generation += 1;
        self.state = ChannelState::Idle;
    }
}

impl NotificationChannel {
    pub fn new(connector: Arc<dyn Connector>, backoff: Duration, grace: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                backoff,
                grace,
                inner: Mutex::new(Inner {
                    agent_id: None,
                    url: None,
                    state: ChannelState::Idle,
                    generation: 0,
                    connection: None,
                    reconnect: None,
                    teardown: None,
                    listeners: Vec::new(),
                    next_listener: 1,
                }),
            }),
        }
    }

    /// Connect as `agent_id`. No-op when already connected (or on the way)
    /// for the same agent; a different agent replaces the old connection.
    pub async fn connect(&self, agent_id: &str, ws_base: &str) {
        let mut inner = self.shared.inner.lock().await;
        if inner.agent_id.as_deref() == Some(agent_id) && inner.state != ChannelState::Idle {
            debug!(agent = %agent_id, "notification channel already active");
            return;
        }
        if inner.state != ChannelState::Idle {
            info!(
                old = ?inner.agent_id,
                new = %agent_id,
                "switching notification channel to a different agent"
            );
        }
        inner.stop();

        let url = notification_url(ws_base, agent_id);
        inner.agent_id = Some(agent_id.to_string());
        inner.url = Some(url.clone());
        start_attempt(&self.shared, &mut inner, url);
    }

    /// Drop the connection and forget the agent.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.stop();
        inner.agent_id = None;
        inner.url = None;
        if let Some(cancel) = inner.teardown.take() {
            cancel.cancel();
        }
        debug!("notification channel disconnected");
    }

    pub async fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock().await;
        if let Some(cancel) = inner.teardown.take() {
            debug!("listener re-added within grace, keeping connection");
            cancel.cancel();
        }
        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    pub async fn remove_listener(&self, id: ListenerId) {
        let mut inner = self.shared.inner.lock().await;
        inner.listeners.retain(|(lid, _)| *lid != id);
        if !inner.listeners.is_empty() || inner.state == ChannelState::Idle {
            return;
        }
        if inner.teardown.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        inner.teardown = Some(cancel.clone());
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(shared.grace) => {}
            }
            let mut inner = shared.inner.lock().await;
            if cancel.is_cancelled() || !inner.listeners.is_empty() {
                return;
            }
            inner.teardown = None;
            inner.stop();
            inner.agent_id = None;
            inner.url = None;
            info!("last notification listener gone, connection closed");
        });
    }

    pub async fn state(&self) -> ChannelState {
        self.shared.inner.lock().await.state
    }

    pub async fn agent_id(&self) -> Option<String> {
        self.shared.inner.lock().await.agent_id.clone()
    }

    pub async fn listener_count(&self) -> usize {
        self.shared.inner.lock().await.listeners.len()
    }
}

impl Shared {
    async fn dispatch(&self, event: &NotificationEvent) {
        let listeners: Vec<Listener> = self
            .inner
            .lock()
            .await
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(event = ?event, "notification listener panicked");
            }
        }
    }

    /// Arrange exactly one retry after the backoff, unless superseded.
    async fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.url.is_none() || inner.reconnect.is_some() {
            return;
        }
        inner.connection = None;
        inner.state = ChannelState::Reconnecting;

        let cancel = CancellationToken::new();
        inner.reconnect = Some(cancel.clone());
        let shared = self.clone();
        let backoff = self.backoff;
        info!(backoff_ms = backoff.as_millis() as u64, "notification channel will reconnect");
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            let mut inner = shared.inner.lock().await;
            if cancel.is_cancelled() || inner.generation != generation {
                return;
            }
            inner.reconnect = None;
            if let Some(url) = inner.url.clone() {
                start_attempt(&shared, &mut inner, url);
            }
        });
    }
}

fn start_attempt(shared: &Arc<Shared>, inner: &mut Inner, url: String) {
    inner.generation += 1;
    inner.state = ChannelState::Connecting;
    let cancel = CancellationToken::new();
    inner.connection = Some(cancel.clone());
    tokio::spawn(run_connection(shared.clone(), inner.generation, url, cancel));
}

async fn run_connection(
    shared: Arc<Shared>,
    generation: u64,
    url: String,
    cancel: CancellationToken,
) {
    let link = tokio::select! {
        _ = cancel.cancelled() => return,
        result = shared.connector.connect(url.clone()) => result,
    };

    let mut link = match link {
        Ok(link) => link,
        Err(e) => {
            warn!(url = %url, "notification channel failed to connect: {}", e);
            shared.schedule_reconnect(generation).await;
            return;
        }
    };

    {
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation || cancel.is_cancelled() {
            let _ = link.outgoing.try_send(WireMessage::Close(Some(NORMAL_CLOSURE)));
            return;
        }
        inner.state = ChannelState::Connected;
    }
    info!(url = %url, "notification channel connected");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = link.outgoing.send(WireMessage::Close(Some(NORMAL_CLOSURE))).await;
                return;
            }
            msg = link.incoming.recv() => match msg {
                Some(WireMessage::Text(text)) => match NotificationEvent::parse(&text) {
                    Ok(event) => shared.dispatch(&event).await,
                    Err(e) => warn!("dropping undecodable notification: {}", e),
                },
                Some(WireMessage::Close(code)) => {
                    info!(code = ?code, "notification channel closed by server");
                    break;
                }
                None => {
                    warn!("notification channel dropped");
                    break;
                }
            }
        }
    }

    shared.schedule_reconnect(generation).await;
}
