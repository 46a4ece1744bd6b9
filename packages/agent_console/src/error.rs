use tokio_tungstenite::tungstenite;

/// Errors surfaced by the console core.
///
/// Most failures inside the multiplexer degrade to a passive status flag and
/// never reach callers; the variants here cover the operations that do
/// return a `Result` (REST calls, transport dials, claims, end-chat).
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("server is unavailable")]
    Unavailable,

    #[error("http request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[source] tungstenite::Error),

    #[error("unexpected payload: {0}")]
    Protocol(String),

    #[error("claim rejected for visitor {visitor_id}: {message}")]
    ClaimRejected { visitor_id: String, message: String },

    #[error("visitor {0} has no conversation session")]
    MissingSession(String),

    #[error("no agent is signed in")]
    NoAgent,

    #[error("multiplexer actor is gone")]
    ActorGone,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConsoleError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Http(err)
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::WebSocket(err)
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Http(_) => "http",
            Self::WebSocket(_) => "websocket",
            Self::Protocol(_) => "protocol",
            Self::ClaimRejected { .. } => "claim_rejected",
            Self::MissingSession(_) => "missing_session",
            Self::NoAgent => "no_agent",
            Self::ActorGone => "actor_gone",
            Self::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for ConsoleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_display() {
        assert_eq!(ConsoleError::Unavailable.to_string(), "server is unavailable");
    }

    #[test]
    fn claim_rejected_display() {
        let err = ConsoleError::ClaimRejected {
            visitor_id: "v-1".into(),
            message: "already taken".into(),
        };
        assert_eq!(
            err.to_string(),
            "claim rejected for visitor v-1: already taken"
        );
        assert_eq!(err.error_code(), "claim_rejected");
    }

    #[test]
    fn serde_error_becomes_protocol() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: ConsoleError = err.into();
        assert!(matches!(err, ConsoleError::Protocol(_)));
        assert_eq!(err.error_code(), "protocol");
    }

    // -- from_reqwest --

    #[tokio::test]
    async fn from_reqwest_connect_error_yields_unavailable() {
        // Port 1 is reserved and nothing listens on it
        let err = reqwest::get("http://127.0.0.1:1/nope").await.unwrap_err();
        assert!(err.is_connect(), "expected a connect error, got: {err}");
        assert!(matches!(
            ConsoleError::from_reqwest(err),
            ConsoleError::Unavailable
        ));
    }

    // -- from_tungstenite --

    #[test]
    fn from_tungstenite_connection_refused() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            ConsoleError::from_tungstenite(tungstenite::Error::Io(io)),
            ConsoleError::Unavailable
        ));
    }

    #[test]
    fn from_tungstenite_connection_reset() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            ConsoleError::from_tungstenite(tungstenite::Error::Io(io)),
            ConsoleError::Unavailable
        ));
    }

    #[test]
    fn from_tungstenite_io_other_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(
            ConsoleError::from_tungstenite(tungstenite::Error::Io(io)),
            ConsoleError::WebSocket(_)
        ));
    }

    #[test]
    fn from_tungstenite_non_io_variant() {
        assert!(matches!(
            ConsoleError::from_tungstenite(tungstenite::Error::ConnectionClosed),
            ConsoleError::WebSocket(_)
        ));
    }
}
