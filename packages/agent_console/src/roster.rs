//! Visitor request queue and roster.
//!
//! The roster is the canonical list of visitors the console knows about,
//! split into pending (waiting for an agent) and active (assigned) lists.
//! It is seeded from REST and then kept current from notification events
//! and the multiplexer's own events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::VisitorApi;
use crate::error::ConsoleError;
use crate::models::{Visitor, resolve_display_name};
use crate::multiplexer::{ConsoleEvent, MultiplexerHandle};
use crate::notification::{ListenerId, NotificationChannel};
use crate::protocol::NotificationEvent;

fn visitor_from_request(
    visitor_id: &str,
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Visitor {
    Visitor {
        display_name: resolve_display_name(None, None, metadata),
        metadata: metadata.clone(),
        ..Visitor::new(visitor_id)
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Pending chat requests in the order they were first seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisitorQueue {
    visitors: Vec<Visitor>,
}

impl VisitorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unassigned visitors from a REST snapshot that aren't queued yet.
    pub fn replenish(&mut self, snapshot: Vec<Visitor>) -> usize {
        let before = self.visitors.len();
        for visitor in snapshot {
            if !visitor.is_assigned() && !self.contains(&visitor.id) {
                self.visitors.push(visitor);
            }
        }
        self.visitors.len() - before
    }

    /// Returns true when the queue changed.
    pub fn apply(&mut self, event: &NotificationEvent) -> bool {
        match event {
            NotificationEvent::NewVisitor {
                visitor_id,
                metadata,
            } => {
                if self.contains(visitor_id) {
                    return false;
                }
                self.visitors
                    .push(visitor_from_request(visitor_id, metadata));
                true
            }
            NotificationEvent::VisitorAssigned { visitor_id, .. }
            | NotificationEvent::VisitorDisconnected { visitor_id } => self.remove(visitor_id),
            NotificationEvent::Unknown => false,
        }
    }

    /// A claimed or disconnected visitor leaves the queue.
    pub fn apply_console_event(&mut self, event: &ConsoleEvent) -> bool {
        match event {
            ConsoleEvent::VisitorActivated(visitor) => self.remove(&visitor.id),
            ConsoleEvent::VisitorDisconnected { visitor_id } => self.remove(visitor_id),
            ConsoleEvent::ClaimFailed { .. } | ConsoleEvent::EndChatFailed { .. } => false,
        }
    }

    pub fn remove(&mut self, visitor_id: &str) -> bool {
        let before = self.visitors.len();
        self.visitors.retain(|v| v.id != visitor_id);
        self.visitors.len() != before
    }

    pub fn contains(&self, visitor_id: &str) -> bool {
        self.visitors.iter().any(|v| v.id == visitor_id)
    }

    pub fn front(&self) -> Option<&Visitor> {
        self.visitors.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Visitor> {
        self.visitors.iter()
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }
}

// =============================================================================
// Roster
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RosterStatus {
    #[default]
    All,
    Pending,
    Active,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterFilter {
    pub status: RosterStatus,
    /// Case-insensitive match on id, name and last message
    pub query: Option<String>,
}

impl RosterFilter {
    fn matches(&self, visitor: &Visitor) -> bool {
        let Some(query) = self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) else {
            return true;
        };
        let query = query.to_lowercase();
        [
            Some(visitor.id.as_str()),
            Some(visitor.label()),
            visitor.last_message.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(&query))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    pub pending: Vec<Visitor>,
    pub active: Vec<Visitor>,
}

impl Roster {
    /// Fetch both lists from REST.
    pub async fn load(api: &dyn VisitorApi) -> Result<Self, ConsoleError> {
        let (pending, active) = tokio::try_join!(api.pending_visitors(), api.active_visitors())?;
        debug!(
            pending = pending.len(),
            active = active.len(),
            "roster loaded"
        );
        Ok(Self { pending, active })
    }

    pub fn get(&self, visitor_id: &str) -> Option<&Visitor> {
        self.pending
            .iter()
            .chain(self.active.iter())
            .find(|v| v.id == visitor_id)
    }

    pub fn is_pending(&self, visitor_id: &str) -> bool {
        self.pending.iter().any(|v| v.id == visitor_id)
    }

    pub fn is_active(&self, visitor_id: &str) -> bool {
        self.active.iter().any(|v| v.id == visitor_id)
    }

    pub fn remove(&mut self, visitor_id: &str) -> bool {
        let before = self.pending.len() + self.active.len();
        self.pending.retain(|v| v.id != visitor_id);
        self.active.retain(|v| v.id != visitor_id);
        before != self.pending.len() + self.active.len()
    }

    fn upsert_active(&mut self, visitor: Visitor) {
        self.pending.retain(|v| v.id != visitor.id);
        match self.active.iter_mut().find(|v| v.id == visitor.id) {
            Some(existing) => *existing = visitor,
            None => self.active.push(visitor),
        }
    }

    /// Apply a notification. `current_agent` decides whether an assignment
    /// makes the visitor ours or takes it off the roster.
    ///
    /// Returns true when a list or a visitor's details changed. A repeated
    /// `new_visitor` with nothing new only refreshes `last_seen` in place.
    pub fn apply_notification(
        &mut self,
        event: &NotificationEvent,
        current_agent: Option<&str>,
    ) -> bool {
        match event {
            NotificationEvent::NewVisitor {
                visitor_id,
                metadata,
            } => {
                if let Some(existing) = self.pending.iter_mut().find(|v| v.id == *visitor_id) {
                    existing.last_seen = Utc::now();
                    let changed = metadata
                        .iter()
                        .any(|(key, value)| existing.metadata.get(key) != Some(value));
                    if changed {
                        existing.metadata.extend(metadata.clone());
                        if let Some(name) = resolve_display_name(None, None, &existing.metadata) {
                            existing.display_name = Some(name);
                        }
                    }
                    return changed;
                }
                if self.is_active(visitor_id) {
                    return false;
                }
                self.pending
                    .push(visitor_from_request(visitor_id, metadata));
                true
            }
            NotificationEvent::VisitorAssigned {
                visitor_id,
                agent_id,
            } => {
                if current_agent != Some(agent_id.as_str()) {
                    return self.remove(visitor_id);
                }
                let mut visitor = self
                    .get(visitor_id)
                    .cloned()
                    .unwrap_or_else(|| Visitor::new(visitor_id.clone()));
                visitor.agent_id = Some(agent_id.clone());
                visitor.last_seen = Utc::now();
                self.upsert_active(visitor);
                true
            }
            NotificationEvent::VisitorDisconnected { visitor_id } => self.remove(visitor_id),
            NotificationEvent::Unknown => false,
        }
    }

    pub fn apply_console_event(&mut self, event: &ConsoleEvent) -> bool {
        match event {
            ConsoleEvent::VisitorActivated(visitor) => {
                self.upsert_active(visitor.clone());
                true
            }
            ConsoleEvent::VisitorDisconnected { visitor_id } => self.remove(visitor_id),
            ConsoleEvent::ClaimFailed { .. } | ConsoleEvent::EndChatFailed { .. } => false,
        }
    }

    /// Drop visitors not seen within `max_age`. Returns the removed ids.
    ///
    /// Visitors for which `is_live` holds have a chat open in the console;
    /// they count as seen at `now` and are never dropped.
    pub fn prune_stale(
        &mut self,
        max_age: Duration,
        now: DateTime<Utc>,
        is_live: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let cutoff = now - max_age;
        let mut removed = Vec::new();
        for list in [&mut self.pending, &mut self.active] {
            list.retain_mut(|v| {
                if is_live(&v.id) {
                    v.last_seen = now;
                    return true;
                }
                let keep = v.last_seen >= cutoff;
                if !keep {
                    removed.push(v.id.clone());
                }
                keep
            });
        }
        removed
    }

    /// Pending visitors first, then active ones.
    pub fn filtered(&self, filter: &RosterFilter) -> Vec<&Visitor> {
        let pending = matches!(filter.status, RosterStatus::All | RosterStatus::Pending);
        let active = matches!(filter.status, RosterStatus::All | RosterStatus::Active);
        self.pending
            .iter()
            .filter(|_| pending)
            .chain(self.active.iter().filter(|_| active))
            .filter(|v| filter.matches(v))
            .collect()
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Background task keeping a [`Roster`] and the [`VisitorQueue`] current.
///
/// Staleness only trims the roster and queue. Chats open in the
/// multiplexer are left alone; they end through the multiplexer or when
/// the server reassigns or disconnects the visitor.
pub struct RosterMonitor {
    roster: watch::Receiver<Roster>,
    queue: watch::Receiver<VisitorQueue>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RosterMonitor {
    /// Load the roster and start following notifications and console events.
    pub async fn start(
        channel: NotificationChannel,
        mux: MultiplexerHandle,
        api: Arc<dyn VisitorApi>,
        stale_after: Option<Duration>,
    ) -> Result<Self, ConsoleError> {
        let initial = Roster::load(api.as_ref()).await?;
        let mut initial_queue = VisitorQueue::new();
        initial_queue.replenish(initial.pending.clone());
        let (roster_tx, roster) = watch::channel(initial);
        let (queue_tx, queue) = watch::channel(initial_queue);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let listener = channel
            .add_listener(move |event| {
                let _ = event_tx.send(event.clone());
            })
            .await;
        let console_events = mux.subscribe_events();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_monitor(
            channel,
            listener,
            mux,
            event_rx,
            console_events,
            roster_tx,
            queue_tx,
            stale_after,
            cancel.clone(),
        ));

        Ok(Self {
            roster,
            queue,
            cancel,
            task,
        })
    }

    pub fn roster(&self) -> Roster {
        self.roster.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Roster> {
        self.roster.clone()
    }

    pub fn queue(&self) -> VisitorQueue {
        self.queue.borrow().clone()
    }

    pub fn watch_queue(&self) -> watch::Receiver<VisitorQueue> {
        self.queue.clone()
    }

    /// Stop following and release the notification listener.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_monitor(
    channel: NotificationChannel,
    listener: ListenerId,
    mux: MultiplexerHandle,
    mut notifications: mpsc::UnboundedReceiver<NotificationEvent>,
    mut console_events: broadcast::Receiver<ConsoleEvent>,
    roster_tx: watch::Sender<Roster>,
    queue_tx: watch::Sender<VisitorQueue>,
    stale_after: Option<Duration>,
    cancel: CancellationToken,
) {
    // Prune at a tenth of the staleness window, at most once a minute
    let prune_every = stale_after
        .map(|d| (d / 10).clamp(Duration::from_millis(10), Duration::from_secs(60)))
        .unwrap_or(Duration::from_secs(60));
    let mut prune = tokio::time::interval(prune_every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(event) = notifications.recv() => {
                let agent = mux.snapshot().agent.map(|a| a.id);
                let changed = roster_tx
                    .send_if_modified(|r| r.apply_notification(&event, agent.as_deref()));
                if changed {
                    debug!(event = ?event, "roster updated from notification");
                }
                let queued = match &event {
                    NotificationEvent::NewVisitor { visitor_id, .. } => {
                        !roster_tx.borrow().is_active(visitor_id)
                    }
                    _ => true,
                };
                if queued {
                    queue_tx.send_if_modified(|q| q.apply(&event));
                }

                let gone = match &event {
                    NotificationEvent::VisitorAssigned { visitor_id, agent_id }
                        if agent.as_deref() != Some(agent_id.as_str()) =>
                    {
                        info!(visitor = %visitor_id, agent = %agent_id, "visitor claimed by another agent");
                        Some(visitor_id)
                    }
                    NotificationEvent::VisitorDisconnected { visitor_id } => Some(visitor_id),
                    _ => None,
                };
                if let Some(visitor_id) = gone {
                    if mux.remove_visitor(visitor_id).await.is_err() {
                        break;
                    }
                }
            }

            event = console_events.recv() => match event {
                Ok(event) => {
                    roster_tx.send_if_modified(|r| r.apply_console_event(&event));
                    queue_tx.send_if_modified(|q| q.apply_console_event(&event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("roster monitor lagged behind {} console events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = prune.tick(), if stale_after.is_some() => {
                if let Some(max_age) = stale_after {
                    let live = mux.snapshot().sessions.clone();
                    let mut removed = Vec::new();
                    roster_tx.send_if_modified(|r| {
                        removed = r.prune_stale(max_age, Utc::now(), |id| live.contains_key(id));
                        !removed.is_empty()
                    });
                    if !removed.is_empty() {
                        queue_tx.send_if_modified(|q| {
                            removed.iter().fold(false, |changed, id| q.remove(id) || changed)
                        });
                    }
                    for visitor_id in removed {
                        debug!(visitor = %visitor_id, "pruned stale visitor");
                    }
                }
            }
        }
    }

    channel.remove_listener(listener).await;
    debug!("roster monitor stopped");
}
