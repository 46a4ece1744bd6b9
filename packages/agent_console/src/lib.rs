//! Live-chat agent console core.
//!
//! The [`multiplexer`] owns one chat session per visitor the agent has open
//! or minimized and reconciles three asynchronous inputs: the notification
//! channel, the per-conversation transports and REST history fetches.
//! [`roster`] and [`take`] sit in front of it; [`notification`] and
//! [`transport`] talk to the server.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod multiplexer;
pub mod notification;
pub mod protocol;
pub mod roster;
pub mod take;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use api::{HttpVisitorApi, VisitorApi};
pub use config::{ConsoleConfig, ConsoleDirs, Timing};
pub use error::ConsoleError;
pub use models::{Agent, ChatMessage, ChatSessionState, ConnectionStatus, Visitor};
pub use multiplexer::{ConsoleEvent, ConsoleSnapshot, MultiplexerHandle};
pub use notification::NotificationChannel;
pub use roster::{Roster, RosterFilter, RosterMonitor, VisitorQueue};
pub use take::{TakeOutcome, TakeWorkflow};
pub use transport::{Connector, WsConnector};
