//! Chat session multiplexer.
//!
//! A single actor task owns every visitor's [`ChatSessionState`], the
//! foreground/minimized layout and the per-conversation transports.
//! Commands, transport notices and timer firings are applied one at a
//! time; after each turn the actor publishes an immutable
//! [`ConsoleSnapshot`] through a watch channel.

mod actor;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::api::VisitorApi;
use crate::config::ConsoleConfig;
use crate::error::ConsoleError;
use crate::models::{Agent, ChatMessage, ChatSessionState, ConnectionStatus, Visitor};
use crate::transport::Connector;

use actor::{Command, MultiplexerActor};

/// Everything a renderer needs, as of the end of one actor turn.
#[derive(Debug, Clone, Default)]
pub struct ConsoleSnapshot {
    pub agent: Option<Agent>,
    pub foreground: Option<Visitor>,
    pub minimized: Vec<Visitor>,
    pub sessions: Arc<HashMap<String, Arc<ChatSessionState>>>,
    /// A foreground switch is waiting out its debounce
    pub is_switching_visitor: bool,
    /// At least one end-chat is in progress
    pub is_ending_chat: bool,
    /// Closing the foreground chat needs explicit confirmation
    pub confirm_end_chat: bool,
}

impl ConsoleSnapshot {
    pub fn session(&self, visitor_id: &str) -> Option<&ChatSessionState> {
        self.sessions.get(visitor_id).map(Arc::as_ref)
    }

    pub fn foreground_id(&self) -> Option<&str> {
        self.foreground.as_ref().map(|v| v.id.as_str())
    }

    pub fn is_minimized(&self, visitor_id: &str) -> bool {
        self.minimized.iter().any(|v| v.id == visitor_id)
    }

    /// The foregrounded or minimized visitor with this id.
    pub fn open_visitor(&self, visitor_id: &str) -> Option<&Visitor> {
        self.foreground
            .iter()
            .chain(self.minimized.iter())
            .find(|v| v.id == visitor_id)
    }

    /// The current agent owns the visitor and its transport is connected.
    pub fn can_send(&self, visitor_id: &str) -> bool {
        let (Some(agent), Some(visitor)) = (&self.agent, self.open_visitor(visitor_id)) else {
            return false;
        };
        visitor.is_assigned_to(&agent.id)
            && self
                .session(visitor_id)
                .is_some_and(|s| s.status == ConnectionStatus::Connected)
    }
}

/// Notifications for collaborators outside the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    /// A visitor was claimed by the current agent
    VisitorActivated(Visitor),
    /// An ended chat finished settling. Sent once per chat.
    VisitorDisconnected { visitor_id: String },
    ClaimFailed { visitor_id: String, message: String },
    EndChatFailed { visitor_id: String, message: String },
}

/// Handle to the multiplexer actor. Cheap to clone.
#[derive(Clone)]
pub struct MultiplexerHandle {
    sender: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ConsoleSnapshot>,
    events: broadcast::Sender<ConsoleEvent>,
}

impl MultiplexerHandle {
    /// Start the actor. The task ends once every handle is dropped.
    pub fn spawn(
        config: ConsoleConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn VisitorApi>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let (snapshot_tx, snapshot) = watch::channel(ConsoleSnapshot::default());
        let (events, _) = broadcast::channel(64);

        let actor = MultiplexerActor::new(
            config,
            connector,
            api,
            receiver,
            sender.downgrade(),
            snapshot_tx,
            events.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            sender,
            snapshot,
            events,
        }
    }

    async fn send(&self, cmd: Command) -> Result<(), ConsoleError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| ConsoleError::ActorGone)
    }

    /// Foreground `visitor`, after the switch debounce when another visitor
    /// is currently in front.
    pub async fn open_chat(&self, visitor: Visitor) -> Result<(), ConsoleError> {
        self.send(Command::OpenChat { visitor }).await
    }

    pub async fn close_chat(&self) -> Result<(), ConsoleError> {
        self.send(Command::CloseChat).await
    }

    pub async fn minimize_chat(&self) -> Result<(), ConsoleError> {
        self.send(Command::MinimizeChat).await
    }

    pub async fn maximize_chat(&self, visitor_id: &str) -> Result<(), ConsoleError> {
        self.send(Command::MaximizeChat {
            visitor_id: visitor_id.to_string(),
        })
        .await
    }

    pub async fn close_minimized_chat(&self, visitor_id: &str) -> Result<(), ConsoleError> {
        self.send(Command::CloseMinimizedChat {
            visitor_id: visitor_id.to_string(),
        })
        .await
    }

    pub async fn cancel_end_chat(&self) -> Result<(), ConsoleError> {
        self.send(Command::CancelEndChat).await
    }

    /// Start ending the chat with `visitor_id`.
    ///
    /// Returns once the request is accepted; completion is observed through
    /// [`ConsoleEvent::VisitorDisconnected`] or [`ConsoleEvent::EndChatFailed`].
    pub async fn end_chat(&self, visitor_id: &str) -> Result<(), ConsoleError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::EndChat {
            visitor_id: visitor_id.to_string(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ConsoleError::ActorGone)?
    }

    /// Send a chat message. `None` when sending is not allowed right now.
    pub async fn send_chat_message(
        &self,
        visitor_id: &str,
        text: &str,
    ) -> Result<Option<ChatMessage>, ConsoleError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SendMessage {
            visitor_id: visitor_id.to_string(),
            text: text.to_string(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ConsoleError::ActorGone)
    }

    pub async fn send_typing_indicator(
        &self,
        visitor_id: &str,
        is_typing: bool,
    ) -> Result<(), ConsoleError> {
        self.send(Command::SendTyping {
            visitor_id: visitor_id.to_string(),
            is_typing,
        })
        .await
    }

    pub async fn send_message_seen(
        &self,
        visitor_id: &str,
        message_id: &str,
    ) -> Result<(), ConsoleError> {
        self.send(Command::SendSeen {
            visitor_id: visitor_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
    }

    pub async fn set_agent(&self, agent: Agent) -> Result<(), ConsoleError> {
        self.send(Command::SetAgent { agent }).await
    }

    /// Forget a visitor that left or was claimed elsewhere.
    pub async fn remove_visitor(&self, visitor_id: &str) -> Result<(), ConsoleError> {
        self.send(Command::RemoveVisitor {
            visitor_id: visitor_id.to_string(),
        })
        .await
    }

    /// Resolves once every command sent before it has been applied.
    pub async fn flush(&self) -> Result<(), ConsoleError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush { respond_to: tx }).await?;
        rx.await.map_err(|_| ConsoleError::ActorGone)
    }

    pub fn snapshot(&self) -> ConsoleSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConsoleSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    /// For collaborators that report on the multiplexer's behalf.
    pub fn event_sender(&self) -> broadcast::Sender<ConsoleEvent> {
        self.events.clone()
    }
}
