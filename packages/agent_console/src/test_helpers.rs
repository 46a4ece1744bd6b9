//! In-memory stand-ins for the network seams, shared by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};

use crate::api::VisitorApi;
use crate::error::ConsoleError;
use crate::models::Visitor;
use crate::protocol::{ConversationHistory, TakeVisitorResponse};
use crate::transport::{Connector, FrameLink, WireMessage};

/// Server side of one fake connection.
pub struct FakePeer {
    pub url: String,
    pub to_client: mpsc::Sender<WireMessage>,
    pub from_client: mpsc::Receiver<WireMessage>,
}

impl FakePeer {
    pub async fn send_json(&self, json: &str) {
        self.to_client
            .send(WireMessage::Text(json.to_string()))
            .await
            .expect("client side of fake link is gone");
    }

    /// Next message from the client, or `None` after a short wait.
    pub async fn next_from_client(&mut self) -> Option<WireMessage> {
        tokio::time::timeout(Duration::from_millis(500), self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next text frame from the client parsed as JSON.
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.next_from_client().await? {
                WireMessage::Text(text) => return serde_json::from_str(&text).ok(),
                WireMessage::Close(_) => return None,
            }
        }
    }
}

/// Connector that hands every dial to the test as a [`FakePeer`].
pub struct FakeConnector {
    dials: Mutex<Vec<String>>,
    refuse: AtomicBool,
    peers: mpsc::UnboundedSender<FakePeer>,
}

impl FakeConnector {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            dials: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            peers,
        };
        (std::sync::Arc::new(connector), peers_rx)
    }

    /// Make subsequent dials fail with `Unavailable`.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn dials(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<FrameLink, ConsoleError>> {
        self.dials.lock().unwrap().push(url.clone());
        if self.refuse.load(Ordering::SeqCst) {
            return async { Err(ConsoleError::Unavailable) }.boxed();
        }
        let (to_client, incoming) = mpsc::channel(64);
        let (outgoing, from_client) = mpsc::channel(64);
        let _ = self.peers.send(FakePeer {
            url,
            to_client,
            from_client,
        });
        async move { Ok(FrameLink { outgoing, incoming }) }.boxed()
    }
}

/// Wait for the next dial, failing the test after a short timeout.
pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<FakePeer>) -> FakePeer {
    tokio::time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("timed out waiting for a dial")
        .expect("connector dropped")
}

/// Canned REST backend.
#[derive(Default)]
pub struct FakeApi {
    pub pending: Mutex<Vec<Visitor>>,
    pub active: Mutex<Vec<Visitor>>,
    pub histories: Mutex<HashMap<String, ConversationHistory>>,
    pub take_responses: Mutex<HashMap<String, TakeVisitorResponse>>,
    pub take_calls: Mutex<Vec<(String, String)>>,
    pub history_calls: Mutex<Vec<String>>,
    /// When set, the next take call waits for this gate before answering.
    pub take_gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Same for the next conversation fetch.
    pub history_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub fail_history: AtomicBool,
}

impl FakeApi {
    pub fn set_history(&self, session_id: &str, json: &str) {
        let history: ConversationHistory = serde_json::from_str(json).unwrap();
        self.histories
            .lock()
            .unwrap()
            .insert(session_id.to_string(), history);
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.lock().unwrap().len()
    }
}

impl VisitorApi for FakeApi {
    fn pending_visitors(&self) -> BoxFuture<'static, Result<Vec<Visitor>, ConsoleError>> {
        let pending = self.pending.lock().unwrap().clone();
        async move { Ok(pending) }.boxed()
    }

    fn active_visitors(&self) -> BoxFuture<'static, Result<Vec<Visitor>, ConsoleError>> {
        let active = self.active.lock().unwrap().clone();
        async move { Ok(active) }.boxed()
    }

    fn take_visitor(
        &self,
        agent_id: String,
        visitor_id: String,
    ) -> BoxFuture<'static, Result<TakeVisitorResponse, ConsoleError>> {
        self.take_calls
            .lock()
            .unwrap()
            .push((agent_id, visitor_id.clone()));
        let response = self
            .take_responses
            .lock()
            .unwrap()
            .get(&visitor_id)
            .cloned()
            .unwrap_or_default();
        let gate = self.take_gate.lock().unwrap().take();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(response)
        }
        .boxed()
    }

    fn conversation(
        &self,
        session_id: String,
    ) -> BoxFuture<'static, Result<ConversationHistory, ConsoleError>> {
        self.history_calls.lock().unwrap().push(session_id.clone());
        let gate = self.history_gate.lock().unwrap().take();
        let result = if self.fail_history.load(Ordering::SeqCst) {
            Err(ConsoleError::Unavailable)
        } else {
            Ok(self
                .histories
                .lock()
                .unwrap()
                .get(&session_id)
                .cloned()
                .unwrap_or_default())
        };
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            result
        }
        .boxed()
    }
}
