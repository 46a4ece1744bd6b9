use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::VisitorApi;
use crate::config::ConsoleConfig;
use crate::error::ConsoleError;
use crate::models::{Agent, ChatMessage, ChatSessionState, ConnectionStatus, SenderRole, Visitor};
use crate::protocol::{ChatFrame, ConversationHistory};
use crate::transport::{Connector, TransportEvent, TransportHandle, TransportNotice, send_once};

use super::{ConsoleEvent, ConsoleSnapshot};

/// Commands processed by the multiplexer actor.
///
/// The variants below `Flush` are posted by the actor's own spawned tasks.
#[derive(Debug)]
pub(crate) enum Command {
    OpenChat {
        visitor: Visitor,
    },
    CloseChat,
    MinimizeChat,
    MaximizeChat {
        visitor_id: String,
    },
    CloseMinimizedChat {
        visitor_id: String,
    },
    CancelEndChat,
    EndChat {
        visitor_id: String,
        respond_to: oneshot::Sender<Result<(), ConsoleError>>,
    },
    SendMessage {
        visitor_id: String,
        text: String,
        respond_to: oneshot::Sender<Option<ChatMessage>>,
    },
    SendTyping {
        visitor_id: String,
        is_typing: bool,
    },
    SendSeen {
        visitor_id: String,
        message_id: String,
    },
    SetAgent {
        agent: Agent,
    },
    RemoveVisitor {
        visitor_id: String,
    },
    Flush {
        respond_to: oneshot::Sender<()>,
    },

    CommitOpen {
        seq: u64,
        visitor: Visitor,
    },
    HistoryLoaded {
        visitor_id: String,
        fetch: u64,
        result: Result<ConversationHistory, ConsoleError>,
    },
    Reconnect {
        visitor_id: String,
    },
    CloseSent {
        visitor_id: String,
    },
    EndFailed {
        visitor_id: String,
        error: String,
    },
    EndSettled {
        visitor_id: String,
    },
}

/// A foreground switch waiting out the debounce.
struct PendingSwitch {
    visitor_id: String,
    cancel: CancellationToken,
}

pub(crate) struct MultiplexerActor {
    config: ConsoleConfig,
    connector: Arc<dyn Connector>,
    api: Arc<dyn VisitorApi>,
    receiver: mpsc::Receiver<Command>,
    /// Weak so that dropping every handle still stops the actor.
    self_sender: mpsc::WeakSender<Command>,
    notices_tx: mpsc::Sender<TransportNotice>,
    notices: mpsc::Receiver<TransportNotice>,
    snapshot_tx: watch::Sender<ConsoleSnapshot>,
    events: broadcast::Sender<ConsoleEvent>,

    agent: Option<Agent>,
    foreground: Option<Visitor>,
    minimized: Vec<Visitor>,
    sessions: Arc<HashMap<String, Arc<ChatSessionState>>>,
    confirm_end_chat: bool,
    ending: HashSet<String>,

    switch_seq: u64,
    pending_switch: Option<PendingSwitch>,
    /// Latest history fetch per visitor; older results are discarded.
    history_fetches: HashMap<String, u64>,
    fetch_seq: u64,
    links: HashMap<String, TransportHandle>,
    reconnects: HashMap<String, CancellationToken>,
    generation: u64,
}

impl MultiplexerActor {
    pub(crate) fn new(
        config: ConsoleConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn VisitorApi>,
        receiver: mpsc::Receiver<Command>,
        self_sender: mpsc::WeakSender<Command>,
        snapshot_tx: watch::Sender<ConsoleSnapshot>,
        events: broadcast::Sender<ConsoleEvent>,
    ) -> Self {
        let (notices_tx, notices) = mpsc::channel(256);
        Self {
            config,
            connector,
            api,
            receiver,
            self_sender,
            notices_tx,
            notices,
            snapshot_tx,
            events,
            agent: None,
            foreground: None,
            minimized: Vec::new(),
            sessions: Arc::new(HashMap::new()),
            confirm_end_chat: false,
            ending: HashSet::new(),
            switch_seq: 0,
            pending_switch: None,
            history_fetches: HashMap::new(),
            fetch_seq: 0,
            links: HashMap::new(),
            reconnects: HashMap::new(),
            generation: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("multiplexer actor started");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(notice) = self.notices.recv() => self.handle_notice(notice),
            }
            self.publish();
        }

        for (_, handle) in self.links.drain() {
            handle.close();
        }
        for (_, cancel) in self.reconnects.drain() {
            cancel.cancel();
        }
        if let Some(pending) = self.pending_switch.take() {
            pending.cancel.cancel();
        }
        debug!("multiplexer actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenChat { visitor } => self.open_chat(visitor),
            Command::CloseChat => self.close_chat(),
            Command::MinimizeChat => self.minimize_chat(),
            Command::MaximizeChat { visitor_id } => self.maximize_chat(&visitor_id),
            Command::CloseMinimizedChat { visitor_id } => self.close_minimized_chat(&visitor_id),
            Command::CancelEndChat => self.confirm_end_chat = false,
            Command::EndChat {
                visitor_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.end_chat(&visitor_id));
            }
            Command::SendMessage {
                visitor_id,
                text,
                respond_to,
            } => {
                let _ = respond_to.send(self.send_chat_message(&visitor_id, text));
            }
            Command::SendTyping {
                visitor_id,
                is_typing,
            } => {
                self.send_frame(
                    &visitor_id,
                    ChatFrame::TypingIndicator {
                        is_typing,
                        sender_type: SenderRole::Agent,
                    },
                );
            }
            Command::SendSeen {
                visitor_id,
                message_id,
            } => {
                self.send_frame(
                    &visitor_id,
                    ChatFrame::MessageSeen {
                        message_id,
                        sender_type: SenderRole::Agent,
                    },
                );
            }
            Command::SetAgent { agent } => self.set_agent(agent),
            Command::RemoveVisitor { visitor_id } => self.remove_visitor(&visitor_id),
            Command::Flush { respond_to } => {
                let _ = respond_to.send(());
            }

            Command::CommitOpen { seq, visitor } => {
                if seq != self.switch_seq {
                    debug!(visitor = %visitor.id, "superseded switch dropped");
                    return;
                }
                self.pending_switch = None;
                self.commit_open(visitor, false);
            }
            Command::HistoryLoaded {
                visitor_id,
                fetch,
                result,
            } => self.apply_history(&visitor_id, fetch, result),
            Command::Reconnect { visitor_id } => {
                self.reconnects.remove(&visitor_id);
                let disconnected = self
                    .sessions
                    .get(&visitor_id)
                    .is_some_and(|s| s.status == ConnectionStatus::Disconnected);
                if disconnected {
                    info!(visitor = %visitor_id, "reconnecting chat transport");
                    self.ensure_transport(&visitor_id);
                }
            }
            Command::CloseSent { visitor_id } => {
                if !self.ending.contains(&visitor_id) {
                    return;
                }
                let settle = self.config.timing.end_chat_settle;
                self.schedule(settle, Command::EndSettled { visitor_id });
            }
            Command::EndFailed { visitor_id, error } => {
                if self.ending.remove(&visitor_id) {
                    warn!(visitor = %visitor_id, "end chat failed: {}", error);
                    self.emit(ConsoleEvent::EndChatFailed {
                        visitor_id: visitor_id.clone(),
                        message: error,
                    });
                    if self.is_open(&visitor_id) {
                        self.schedule_reconnect(&visitor_id);
                    }
                }
            }
            Command::EndSettled { visitor_id } => {
                if !self.ending.remove(&visitor_id) {
                    return;
                }
                self.drop_visitor(&visitor_id);
                info!(visitor = %visitor_id, "chat ended");
                self.emit(ConsoleEvent::VisitorDisconnected { visitor_id });
            }
        }
    }

    // =========================================================================
    // Layout
    // =========================================================================

    fn open_chat(&mut self, visitor: Visitor) {
        self.cancel_pending_switch();

        let switching = self
            .foreground
            .as_ref()
            .is_some_and(|fg| fg.id != visitor.id);
        if !switching {
            self.commit_open(visitor, false);
            return;
        }

        self.switch_seq += 1;
        let seq = self.switch_seq;
        let cancel = CancellationToken::new();
        self.pending_switch = Some(PendingSwitch {
            visitor_id: visitor.id.clone(),
            cancel: cancel.clone(),
        });
        debug!(visitor = %visitor.id, "switch pending");
        let delay = self.config.timing.switch_delay;
        self.schedule_cancellable(delay, cancel, Command::CommitOpen { seq, visitor });
    }

    /// Foreground `visitor` now.
    fn commit_open(&mut self, visitor: Visitor, confirm_end: bool) {
        let id = visitor.id.clone();

        if let Some(displaced) = self.foreground.take() {
            if displaced.id != id && !self.is_minimized(&displaced.id) {
                debug!(visitor = %displaced.id, "displaced chat minimized");
                self.minimized.push(displaced);
            }
        }
        self.minimized.retain(|v| v.id != id);

        if self.agent.is_none() {
            if let Some(agent_id) = &visitor.agent_id {
                info!(agent = %agent_id, "adopting visitor's agent as current agent");
                self.agent = Some(Agent::new(agent_id.clone()));
            }
        }

        if !self.sessions.contains_key(&id) {
            Arc::make_mut(&mut self.sessions)
                .insert(id.clone(), Arc::new(ChatSessionState::default()));
        }

        let session_id = visitor.session_id.clone();
        self.foreground = Some(visitor);
        self.confirm_end_chat = confirm_end;

        if let Some(session_id) = session_id {
            self.start_history_fetch(&id, session_id);
        }
        self.ensure_transport(&id);
    }

    fn close_chat(&mut self) {
        let Some(fg) = &self.foreground else {
            return;
        };
        let owned = self
            .agent
            .as_ref()
            .is_some_and(|agent| fg.is_assigned_to(&agent.id));
        if owned {
            self.confirm_end_chat = true;
            return;
        }

        let id = fg.id.clone();
        self.close_link(&id);
        self.foreground = None;
        self.confirm_end_chat = false;
    }

    fn minimize_chat(&mut self) {
        let Some(fg) = self.foreground.take() else {
            return;
        };
        if !self.is_minimized(&fg.id) {
            self.minimized.push(fg);
        }
        self.confirm_end_chat = false;
    }

    fn maximize_chat(&mut self, visitor_id: &str) {
        let Some(pos) = self.minimized.iter().position(|v| v.id == visitor_id) else {
            return;
        };
        self.cancel_pending_switch();
        let visitor = self.minimized.remove(pos);
        self.commit_open(visitor, false);
    }

    fn close_minimized_chat(&mut self, visitor_id: &str) {
        let Some(visitor) = self.minimized.iter().find(|v| v.id == visitor_id).cloned() else {
            return;
        };
        self.cancel_pending_switch();
        self.commit_open(visitor, true);
    }

    fn set_agent(&mut self, agent: Agent) {
        info!(agent = %agent.id, "current agent set");
        self.agent = Some(agent);
        let open: Vec<String> = self.open_visitors().map(|v| v.id.clone()).collect();
        for id in open {
            self.ensure_transport(&id);
        }
    }

    fn remove_visitor(&mut self, visitor_id: &str) {
        if self
            .pending_switch
            .as_ref()
            .is_some_and(|p| p.visitor_id == visitor_id)
        {
            self.cancel_pending_switch();
        }
        self.ending.remove(visitor_id);
        if self.sessions.contains_key(visitor_id) || self.is_open(visitor_id) {
            info!(visitor = %visitor_id, "removing visitor");
        }
        self.drop_visitor(visitor_id);
    }

    /// Tear down everything held for a visitor.
    fn drop_visitor(&mut self, visitor_id: &str) {
        self.close_link(visitor_id);
        self.history_fetches.remove(visitor_id);
        if self.sessions.contains_key(visitor_id) {
            Arc::make_mut(&mut self.sessions).remove(visitor_id);
        }
        self.minimized.retain(|v| v.id != visitor_id);
        if self.foreground_id() == Some(visitor_id) {
            self.foreground = None;
            self.confirm_end_chat = false;
        }
    }

    fn cancel_pending_switch(&mut self) {
        if let Some(pending) = self.pending_switch.take() {
            pending.cancel.cancel();
            self.switch_seq += 1;
        }
    }

    // =========================================================================
    // End chat
    // =========================================================================

    fn end_chat(&mut self, visitor_id: &str) -> Result<(), ConsoleError> {
        if self.ending.contains(visitor_id) {
            debug!(visitor = %visitor_id, "end chat already in progress");
            return Ok(());
        }
        let session_id = self
            .open_visitor(visitor_id)
            .and_then(|v| v.session_id.clone())
            .ok_or_else(|| ConsoleError::MissingSession(visitor_id.to_string()))?;
        let agent_id = self
            .agent
            .as_ref()
            .map(|a| a.id.clone())
            .ok_or(ConsoleError::NoAgent)?;

        info!(visitor = %visitor_id, session = %session_id, "ending chat");
        self.ending.insert(visitor_id.to_string());
        self.confirm_end_chat = false;
        if let Some(cancel) = self.reconnects.remove(visitor_id) {
            cancel.cancel();
        }

        let url = self.config.chat_url(&session_id, &agent_id);
        let connector = self.connector.clone();
        let visitor_id = visitor_id.to_string();
        self.spawn_reporting(async move {
            match send_once(connector.as_ref(), url, &ChatFrame::CloseSession).await {
                Ok(()) => Command::CloseSent { visitor_id },
                Err(e) => Command::EndFailed {
                    visitor_id,
                    error: e.to_string(),
                },
            }
        });
        Ok(())
    }

    // =========================================================================
    // Sending
    // =========================================================================

    fn can_send(&self, visitor_id: &str) -> bool {
        let (Some(agent), Some(visitor)) = (&self.agent, self.open_visitor(visitor_id)) else {
            return false;
        };
        visitor.is_assigned_to(&agent.id)
            && self.links.contains_key(visitor_id)
            && self
                .sessions
                .get(visitor_id)
                .is_some_and(|s| s.status == ConnectionStatus::Connected)
    }

    fn send_frame(&self, visitor_id: &str, frame: ChatFrame) -> bool {
        if !self.can_send(visitor_id) {
            debug!(visitor = %visitor_id, "send dropped: not allowed");
            return false;
        }
        self.links
            .get(visitor_id)
            .is_some_and(|link| link.send(&frame))
    }

    fn send_chat_message(&mut self, visitor_id: &str, text: String) -> Option<ChatMessage> {
        let agent_id = self.agent.as_ref()?.id.clone();
        let message = ChatMessage::new(SenderRole::Agent, Some(agent_id), text);
        if !self.send_frame(visitor_id, ChatFrame::from_message(&message)) {
            return None;
        }
        let appended = message.clone();
        self.update_session(visitor_id, |s| {
            s.push_message(appended);
        });
        Some(message)
    }

    // =========================================================================
    // History
    // =========================================================================

    fn start_history_fetch(&mut self, visitor_id: &str, session_id: String) {
        self.fetch_seq += 1;
        let fetch = self.fetch_seq;
        self.history_fetches.insert(visitor_id.to_string(), fetch);
        self.update_session(visitor_id, |s| s.is_loading_history = true);

        let api = self.api.clone();
        let visitor_id = visitor_id.to_string();
        self.spawn_reporting(async move {
            let result = api.conversation(session_id).await;
            Command::HistoryLoaded {
                visitor_id,
                fetch,
                result,
            }
        });
    }

    fn apply_history(
        &mut self,
        visitor_id: &str,
        fetch: u64,
        result: Result<ConversationHistory, ConsoleError>,
    ) {
        if self.history_fetches.get(visitor_id) != Some(&fetch) {
            debug!(visitor = %visitor_id, "dropping stale history result");
            return;
        }
        self.history_fetches.remove(visitor_id);

        match result {
            Ok(history) => {
                let messages = history.into_messages();
                debug!(visitor = %visitor_id, count = messages.len(), "history loaded");
                self.update_session(visitor_id, |s| {
                    s.replace_history(messages);
                    s.is_loading_history = false;
                });
            }
            Err(e) => {
                warn!(visitor = %visitor_id, "history fetch failed: {}", e);
                self.update_session(visitor_id, |s| s.is_loading_history = false);
            }
        }
    }

    // =========================================================================
    // Transports
    // =========================================================================

    /// Open a transport for an open visitor if none is live and both ids are known.
    fn ensure_transport(&mut self, visitor_id: &str) {
        let Some(session_id) = self.open_visitor(visitor_id).and_then(|v| v.session_id.clone())
        else {
            debug!(visitor = %visitor_id, "no session id yet, transport deferred");
            return;
        };
        let Some(agent_id) = self.agent.as_ref().map(|a| a.id.clone()) else {
            debug!(visitor = %visitor_id, "no current agent yet, transport deferred");
            return;
        };
        if self.ending.contains(visitor_id) {
            return;
        }
        let live = self
            .sessions
            .get(visitor_id)
            .is_some_and(|s| s.status.is_live());
        if live && self.links.contains_key(visitor_id) {
            return;
        }

        if let Some(cancel) = self.reconnects.remove(visitor_id) {
            cancel.cancel();
        }
        if let Some(old) = self.links.remove(visitor_id) {
            old.close();
        }

        self.generation += 1;
        let url = self.config.chat_url(&session_id, &agent_id);
        debug!(visitor = %visitor_id, url = %url, generation = self.generation, "opening chat transport");
        let handle = TransportHandle::open(
            self.connector.clone(),
            url,
            visitor_id.to_string(),
            self.generation,
            self.notices_tx.clone(),
        );
        self.links.insert(visitor_id.to_string(), handle);
        self.update_session(visitor_id, |s| s.status = ConnectionStatus::Connecting);
    }

    /// Close the transport with a normal closure and cancel its retry timer.
    fn close_link(&mut self, visitor_id: &str) {
        if let Some(cancel) = self.reconnects.remove(visitor_id) {
            cancel.cancel();
        }
        if let Some(handle) = self.links.remove(visitor_id) {
            handle.close();
            self.update_session(visitor_id, |s| {
                s.status = ConnectionStatus::Disconnected;
                s.is_typing = false;
            });
        }
    }

    fn handle_notice(&mut self, notice: TransportNotice) {
        let TransportNotice {
            visitor_id,
            generation,
            event,
        } = notice;
        let current = self
            .links
            .get(&visitor_id)
            .is_some_and(|h| h.generation() == generation);
        if !current {
            debug!(visitor = %visitor_id, generation, "ignoring event from replaced transport");
            return;
        }

        match event {
            TransportEvent::Opened => {
                self.update_session(&visitor_id, |s| s.status = ConnectionStatus::Connected);
            }
            TransportEvent::Frame(frame) => self.apply_frame(&visitor_id, frame),
            TransportEvent::Closed { .. } | TransportEvent::Failed { .. } => {
                self.links.remove(&visitor_id);
                self.update_session(&visitor_id, |s| {
                    s.status = ConnectionStatus::Disconnected;
                    s.is_typing = false;
                });
                self.schedule_reconnect(&visitor_id);
            }
        }
    }

    fn apply_frame(&mut self, visitor_id: &str, frame: ChatFrame) {
        match frame {
            ChatFrame::ChatMessage { .. } => {
                if let Some(message) = frame.into_message() {
                    self.update_session(visitor_id, |s| {
                        s.push_message(message);
                    });
                }
            }
            ChatFrame::TypingIndicator {
                is_typing,
                sender_type: SenderRole::Visitor,
            } => {
                self.update_session(visitor_id, |s| s.is_typing = is_typing);
            }
            ChatFrame::MessageSeen {
                message_id,
                sender_type: SenderRole::Visitor,
            } => {
                self.update_session(visitor_id, |s| {
                    s.mark_read(&message_id);
                });
            }
            ChatFrame::TypingIndicator { .. } | ChatFrame::MessageSeen { .. } => {}
            ChatFrame::CloseSession | ChatFrame::Unknown => {
                debug!(visitor = %visitor_id, "ignoring control frame");
            }
        }
    }

    /// Retry a dropped transport later, while the visitor is still wanted.
    fn schedule_reconnect(&mut self, visitor_id: &str) {
        if !self.is_open(visitor_id) || self.ending.contains(visitor_id) {
            return;
        }
        if let Some(old) = self.reconnects.remove(visitor_id) {
            old.cancel();
        }
        let cancel = CancellationToken::new();
        self.reconnects
            .insert(visitor_id.to_string(), cancel.clone());
        let delay = self.config.timing.reconnect_delay;
        self.schedule_cancellable(
            delay,
            cancel,
            Command::Reconnect {
                visitor_id: visitor_id.to_string(),
            },
        );
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn open_visitors(&self) -> impl Iterator<Item = &Visitor> {
        self.foreground.iter().chain(self.minimized.iter())
    }

    fn open_visitor(&self, visitor_id: &str) -> Option<&Visitor> {
        self.open_visitors().find(|v| v.id == visitor_id)
    }

    fn is_open(&self, visitor_id: &str) -> bool {
        self.open_visitor(visitor_id).is_some()
    }

    fn is_minimized(&self, visitor_id: &str) -> bool {
        self.minimized.iter().any(|v| v.id == visitor_id)
    }

    fn foreground_id(&self) -> Option<&str> {
        self.foreground.as_ref().map(|v| v.id.as_str())
    }

    /// Copy-on-write edit of one visitor's session. Missing entries stay missing.
    fn update_session(&mut self, visitor_id: &str, f: impl FnOnce(&mut ChatSessionState)) {
        if !self.sessions.contains_key(visitor_id) {
            return;
        }
        if let Some(state) = Arc::make_mut(&mut self.sessions).get_mut(visitor_id) {
            f(Arc::make_mut(state));
        }
    }

    fn emit(&self, event: ConsoleEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(ConsoleSnapshot {
            agent: self.agent.clone(),
            foreground: self.foreground.clone(),
            minimized: self.minimized.clone(),
            sessions: self.sessions.clone(),
            is_switching_visitor: self.pending_switch.is_some(),
            is_ending_chat: !self.ending.is_empty(),
            confirm_end_chat: self.confirm_end_chat,
        });
    }

    /// Run `task` off the actor and feed its result back in as a command.
    fn spawn_reporting<F>(&self, task: F)
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let Some(sender) = self.self_sender.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let cmd = task.await;
            let _ = sender.send(cmd).await;
        });
    }

    fn schedule(&self, delay: Duration, cmd: Command) {
        self.spawn_reporting(async move {
            tokio::time::sleep(delay).await;
            cmd
        });
    }

    fn schedule_cancellable(&self, delay: Duration, cancel: CancellationToken, cmd: Command) {
        let Some(sender) = self.self_sender.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = sender.send(cmd).await;
                }
            }
        });
    }
}
