//! Chat transports.
//!
//! - `socket`: the tokio-tungstenite `Connector` used in production
//! - `session`: one per-conversation transport per open visitor
//!
//! Everything above this module talks to sockets through [`Connector`] and
//! [`FrameLink`], so tests can swap the network for in-memory channels.

mod session;
mod socket;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::ConsoleError;

pub use session::{TransportEvent, TransportHandle, TransportNotice, send_once};
pub use socket::WsConnector;

/// WebSocket close code for an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// A single message on an established link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    /// Close with an optional status code
    Close(Option<u16>),
}

/// Both halves of an established connection.
///
/// The link is gone when `incoming` yields `None` (error or drop) or a
/// `WireMessage::Close` (orderly close from the peer).
pub struct FrameLink {
    pub outgoing: mpsc::Sender<WireMessage>,
    pub incoming: mpsc::Receiver<WireMessage>,
}

/// Dials a URL and hands back a [`FrameLink`].
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<FrameLink, ConsoleError>>;
}
