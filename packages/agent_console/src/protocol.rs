//! Wire Protocol Types
//!
//! JSON frames exchanged over the notification channel and the
//! per-conversation chat transport, plus the REST payloads.

use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;
use crate::models::{ChatMessage, DeliveryStatus, SenderRole, Visitor, generate_message_id};

/// Events pushed on the agent notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A visitor started a chat request and is waiting for an agent.
    NewVisitor {
        visitor_id: String,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    /// A visitor was claimed by some agent (possibly us).
    VisitorAssigned { visitor_id: String, agent_id: String },
    /// The visitor left the site or the server dropped them.
    VisitorDisconnected { visitor_id: String },
    /// Any other `type`; consumers outside the core may care, we don't.
    #[serde(other)]
    Unknown,
}

impl NotificationEvent {
    pub fn parse(text: &str) -> Result<Self, ConsoleError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn visitor_id(&self) -> Option<&str> {
        match self {
            Self::NewVisitor { visitor_id, .. }
            | Self::VisitorAssigned { visitor_id, .. }
            | Self::VisitorDisconnected { visitor_id } => Some(visitor_id),
            Self::Unknown => None,
        }
    }
}

/// Frames on a per-conversation chat transport (both directions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    ChatMessage {
        #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        message: String,
        sender_type: SenderRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    TypingIndicator {
        is_typing: bool,
        sender_type: SenderRole,
    },
    MessageSeen {
        message_id: String,
        sender_type: SenderRole,
    },
    /// Agent → server only: end the conversation.
    CloseSession,
    #[serde(other)]
    Unknown,
}

impl ChatFrame {
    pub fn parse(text: &str) -> Result<Self, ConsoleError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ConsoleError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Frame that carries an agent-authored message.
    pub fn from_message(message: &ChatMessage) -> Self {
        Self::ChatMessage {
            message_id: Some(message.id.clone()),
            message: message.body.clone(),
            sender_type: message.sender,
            sender_id: message.sender_id.clone(),
            timestamp: Some(message.timestamp.clone()),
        }
    }

    /// Convert a content frame into a log entry; other frames yield `None`.
    pub fn into_message(self) -> Option<ChatMessage> {
        match self {
            Self::ChatMessage {
                message_id,
                message,
                sender_type,
                sender_id,
                timestamp,
            } => Some(ChatMessage {
                id: message_id.unwrap_or_else(generate_message_id),
                sender: sender_type,
                sender_id,
                body: message,
                timestamp: timestamp.unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                status: None,
            }),
            _ => None,
        }
    }
}

// =============================================================================
// REST payloads
// =============================================================================

/// Visitor list endpoints answer either with a bare array or `{visitors: [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VisitorList {
    Bare(Vec<Visitor>),
    Wrapped { visitors: Vec<Visitor> },
}

impl VisitorList {
    pub fn into_vec(self) -> Vec<Visitor> {
        match self {
            Self::Bare(v) | Self::Wrapped { visitors: v } => v,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeVisitorRequest {
    pub agent_id: String,
    pub visitor_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TakeVisitorResponse {
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub visitor_past_count: u32,
    #[serde(default)]
    pub visitor_chat_count: u32,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// Failure reason when `success` is false
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    #[serde(default, alias = "id")]
    pub message_id: Option<String>,
    pub sender_type: SenderRole,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub message: String,
    pub timestamp: String,
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
}

impl From<HistoryMessage> for ChatMessage {
    fn from(h: HistoryMessage) -> Self {
        let status = if h.sender_type == SenderRole::Agent {
            h.status
        } else {
            None
        };
        ChatMessage {
            id: h.message_id.unwrap_or_else(generate_message_id),
            sender: h.sender_type,
            sender_id: h.sender_id,
            body: h.message,
            timestamp: h.timestamp,
            status,
        }
    }
}

impl ConversationHistory {
    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages.into_iter().map(ChatMessage::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notification_kinds() {
        let e = NotificationEvent::parse(
            r#"{"type":"new_visitor","visitor_id":"v1","metadata":{"name":"Bob"}}"#,
        )
        .unwrap();
        match &e {
            NotificationEvent::NewVisitor { visitor_id, metadata } => {
                assert_eq!(visitor_id, "v1");
                assert_eq!(metadata["name"], "Bob");
            }
            other => panic!("unexpected {other:?}"),
        }

        let e = NotificationEvent::parse(
            r#"{"type":"visitor_assigned","visitor_id":"v1","agent_id":"A1"}"#,
        )
        .unwrap();
        assert_eq!(
            e,
            NotificationEvent::VisitorAssigned {
                visitor_id: "v1".into(),
                agent_id: "A1".into()
            }
        );
        assert_eq!(e.visitor_id(), Some("v1"));
    }

    #[test]
    fn unknown_notification_type_falls_back() {
        let e = NotificationEvent::parse(r#"{"type":"agent_status","online":true}"#).unwrap();
        assert_eq!(e, NotificationEvent::Unknown);
        assert_eq!(e.visitor_id(), None);
    }

    #[test]
    fn malformed_notification_is_protocol_error() {
        let err = NotificationEvent::parse(r#"{"type":"new_visitor"}"#).unwrap_err();
        assert!(matches!(err, ConsoleError::Protocol(_)));
    }

    #[test]
    fn typing_frame_roundtrip_shape() {
        let frame = ChatFrame::TypingIndicator {
            is_typing: true,
            sender_type: SenderRole::Agent,
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "typing_indicator");
        assert_eq!(json["is_typing"], true);
        assert_eq!(json["sender_type"], "agent");
    }

    #[test]
    fn close_session_has_only_type() {
        assert_eq!(
            ChatFrame::CloseSession.to_json().unwrap(),
            r#"{"type":"close_session"}"#
        );
    }

    #[test]
    fn chat_message_frame_without_id_gets_local_id() {
        let frame = ChatFrame::parse(
            r#"{"type":"chat_message","message":"hi","sender_type":"visitor"}"#,
        )
        .unwrap();
        let msg = frame.into_message().unwrap();
        assert!(!msg.id.is_empty());
        assert_eq!(msg.sender, SenderRole::Visitor);
        assert_eq!(msg.body, "hi");
    }

    #[test]
    fn chat_message_frame_accepts_id_alias() {
        let frame = ChatFrame::parse(
            r#"{"type":"chat_message","id":"srv-1","message":"hi","sender_type":"agent","sender_id":"A1"}"#,
        )
        .unwrap();
        let msg = frame.into_message().unwrap();
        assert_eq!(msg.id, "srv-1");
        assert_eq!(msg.sender_id.as_deref(), Some("A1"));
    }

    #[test]
    fn unknown_chat_frame_falls_back() {
        let frame = ChatFrame::parse(r#"{"type":"presence","online":false}"#).unwrap();
        assert_eq!(frame, ChatFrame::Unknown);
        assert!(frame.into_message().is_none());
    }

    #[test]
    fn take_response_defaults() {
        let r: TakeVisitorResponse =
            serde_json::from_str(r#"{"success":false,"error":"already assigned"}"#).unwrap();
        assert!(!r.success);
        assert_eq!(r.message.as_deref(), Some("already assigned"));
        assert!(r.session_id.is_none());
    }

    #[test]
    fn visitor_list_accepts_both_shapes() {
        let bare: VisitorList = serde_json::from_str(r#"[{"id":"v1"}]"#).unwrap();
        assert_eq!(bare.into_vec().len(), 1);
        let wrapped: VisitorList =
            serde_json::from_str(r#"{"visitors":[{"id":"v1"},{"id":"v2"}]}"#).unwrap();
        assert_eq!(wrapped.into_vec().len(), 2);
    }

    #[test]
    fn history_drops_status_on_visitor_messages() {
        let history: ConversationHistory = serde_json::from_str(
            r#"{"messages":[
                {"message_id":"m1","sender_type":"agent","sender_id":"A1","message":"hi","timestamp":"t1","status":"read"},
                {"sender_type":"visitor","message":"yo","timestamp":"t2","status":"read"}
            ]}"#,
        )
        .unwrap();
        let msgs = history.into_messages();
        assert_eq!(msgs[0].id, "m1");
        assert_eq!(msgs[0].status, Some(DeliveryStatus::Read));
        assert_eq!(msgs[1].status, None);
    }
}
