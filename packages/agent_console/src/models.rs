//! Core data model: visitors, chat messages and per-visitor session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote chat participant as seen by the console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visitor {
    #[serde(alias = "visitor_id")]
    pub id: String,
    /// Assigned agent; absent while the visitor is still pending.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    /// Conversation session, issued when an agent takes the visitor.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub is_disconnected: bool,
    #[serde(default)]
    pub past_count: u32,
    #[serde(default)]
    pub chat_count: u32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl Visitor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: None,
            display_name: None,
            session_id: None,
            last_message: None,
            is_disconnected: false,
            past_count: 0,
            chat_count: 0,
            metadata: serde_json::Map::new(),
            last_seen: Utc::now(),
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.agent_id.is_some()
    }

    pub fn is_assigned_to(&self, agent_id: &str) -> bool {
        self.agent_id.as_deref() == Some(agent_id)
    }

    /// Name to show in lists: server-resolved name, then visitor-supplied
    /// metadata, then the raw id.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or_else(|| self.metadata.get("name").and_then(|v| v.as_str()))
            .unwrap_or(&self.id)
    }
}

/// Resolve a display name from server first/last name, falling back to the
/// visitor-supplied `name` metadata field.
pub fn resolve_display_name(
    first_name: Option<&str>,
    last_name: Option<&str>,
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Option<String> {
    let joined = [first_name, last_name]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !joined.is_empty() {
        return Some(joined);
    }
    metadata
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The acting agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Visitor,
    Agent,
    System,
}

/// Delivery of an agent-sent message. `None` on the message means undefined.
/// Ordering follows the only permitted direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: SenderRole,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub body: String,
    pub timestamp: String,
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
}

impl ChatMessage {
    pub fn new(sender: SenderRole, sender_id: Option<String>, body: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            sender,
            sender_id,
            body: body.into(),
            timestamp: Utc::now().to_rfc3339(),
            status: None,
        }
    }

    /// Move the delivery status forward; never backwards.
    pub fn advance_status(&mut self, to: DeliveryStatus) -> bool {
        if self.sender != SenderRole::Agent || self.status >= Some(to) {
            return false;
        }
        self.status = Some(to);
        true
    }
}

/// Locally unique message id: `<unix millis>-<random>`.
pub fn generate_message_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &random[..12])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    /// Connecting or connected: a transport exists and must not be duplicated.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Everything the console knows about one visitor's conversation.
///
/// Values are treated as immutable once published; the multiplexer clones,
/// edits and republishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatSessionState {
    pub messages: Vec<ChatMessage>,
    pub status: ConnectionStatus,
    /// The visitor is typing
    pub is_typing: bool,
    pub is_loading_history: bool,
}

impl ChatSessionState {
    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append a message received or sent over the transport.
    ///
    /// A message whose id is already present is not appended again; if it
    /// is the server echo of an agent message it counts as delivered.
    /// Returns true when the log changed.
    pub fn push_message(&mut self, message: ChatMessage) -> bool {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            return existing.advance_status(DeliveryStatus::Delivered);
        }
        if message.sender == SenderRole::Visitor {
            self.is_typing = false;
        }
        self.messages.push(message);
        true
    }

    /// Advance an agent message to read. Unknown ids are ignored.
    pub fn mark_read(&mut self, message_id: &str) -> bool {
        self.messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .is_some_and(|m| m.advance_status(DeliveryStatus::Read))
    }

    /// Replace the whole log with server history.
    ///
    /// Delivery status already observed for a message id is carried over
    /// when it is further along than what the history reports.
    pub fn replace_history(&mut self, mut history: Vec<ChatMessage>) {
        for fetched in &mut history {
            if let Some(previous) = self.message(&fetched.id) {
                if previous.status > fetched.status {
                    fetched.status = previous.status;
                }
            }
        }
        self.messages = history;
    }
}
