use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConsoleError;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [server]
//                    http_base = "https://chat.example.com/api"
//
//   env var:         CONSOLE_SERVER__HTTP_BASE=https://chat.example.com/api
//
//   (single underscore stays within field names: CONSOLE_TIMING__SWITCH_DELAY_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub timing: TimingFileConfig,
}

/// Endpoints of the chat backend (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_http_base")]
    pub http_base: String,
    #[serde(default = "default_ws_base")]
    pub ws_base: String,
    /// Tenant identifier used in the visitor list endpoints.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            http_base: default_http_base(),
            ws_base: default_ws_base(),
            client_id: default_client_id(),
        }
    }
}

/// Delays and backoffs (lives under `[timing]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimingFileConfig {
    #[serde(default = "default_switch_delay_ms")]
    pub switch_delay_ms: u64,
    #[serde(default = "default_end_chat_settle_ms")]
    pub end_chat_settle_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_notification_backoff_ms")]
    pub notification_backoff_ms: u64,
    #[serde(default = "default_listener_grace_ms")]
    pub listener_grace_ms: u64,
    #[serde(default = "default_take_cooldown_ms")]
    pub take_cooldown_ms: u64,
    /// Visitors not seen for this long are pruned from the roster (0 = never).
    #[serde(default = "default_stale_visitor_secs")]
    pub stale_visitor_secs: u64,
}

impl Default for TimingFileConfig {
    fn default() -> Self {
        Self {
            switch_delay_ms: default_switch_delay_ms(),
            end_chat_settle_ms: default_end_chat_settle_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            notification_backoff_ms: default_notification_backoff_ms(),
            listener_grace_ms: default_listener_grace_ms(),
            take_cooldown_ms: default_take_cooldown_ms(),
            stale_visitor_secs: default_stale_visitor_secs(),
        }
    }
}

fn default_http_base() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_ws_base() -> String {
    "ws://127.0.0.1:8000".to_string()
}
fn default_client_id() -> String {
    "default".to_string()
}
fn default_switch_delay_ms() -> u64 {
    150
}
fn default_end_chat_settle_ms() -> u64 {
    1000
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_notification_backoff_ms() -> u64 {
    5000
}
fn default_listener_grace_ms() -> u64 {
    1000
}
fn default_take_cooldown_ms() -> u64 {
    1000
}
fn default_stale_visitor_secs() -> u64 {
    600
}

/// Build a figment that layers: defaults → config.toml → CONSOLE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CONSOLE_SERVER__CLIENT_ID=acme`  →  `server.client_id = "acme"`
///   `CONSOLE_TIMING__RECONNECT_DELAY_MS=500`  →  `timing.reconnect_delay_ms = 500`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CONSOLE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, handed to every component)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub http_base: String,
    pub ws_base: String,
    pub client_id: String,
    pub timing: Timing,
}

#[derive(Clone, Debug)]
pub struct Timing {
    /// UX debounce before a foreground switch commits
    pub switch_delay: Duration,
    /// Wait after `close_session` before the session is dropped locally
    pub end_chat_settle: Duration,
    /// Retry delay for a dropped chat transport
    pub reconnect_delay: Duration,
    /// Retry delay for a dropped notification channel
    pub notification_backoff: Duration,
    /// Teardown delay after the last notification listener leaves
    pub listener_grace: Duration,
    /// How long a settled claim keeps blocking repeats
    pub take_cooldown: Duration,
    pub stale_visitor: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_file(&TimingFileConfig::default())
    }
}

impl Timing {
    pub fn from_file(fc: &TimingFileConfig) -> Self {
        Self {
            switch_delay: Duration::from_millis(fc.switch_delay_ms),
            end_chat_settle: Duration::from_millis(fc.end_chat_settle_ms),
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            notification_backoff: Duration::from_millis(fc.notification_backoff_ms),
            listener_grace: Duration::from_millis(fc.listener_grace_ms),
            take_cooldown: Duration::from_millis(fc.take_cooldown_ms),
            stale_visitor: if fc.stale_visitor_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.stale_visitor_secs))
            },
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl ConsoleConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            http_base: fc.server.http_base.trim_end_matches('/').to_string(),
            ws_base: fc.server.ws_base.trim_end_matches('/').to_string(),
            client_id: fc.server.client_id.clone(),
            timing: Timing::from_file(&fc.timing),
        }
    }

    pub fn chat_url(&self, session_id: &str, agent_id: &str) -> String {
        chat_url(&self.ws_base, session_id, agent_id)
    }

    /// Reject base URLs with the wrong scheme before anything dials them.
    pub fn validate(&self) -> Result<(), ConsoleError> {
        if !(self.http_base.starts_with("http://") || self.http_base.starts_with("https://")) {
            return Err(ConsoleError::Config(format!(
                "server.http_base must be an http(s) URL, got {:?}",
                self.http_base
            )));
        }
        if !(self.ws_base.starts_with("ws://") || self.ws_base.starts_with("wss://")) {
            return Err(ConsoleError::Config(format!(
                "server.ws_base must be a ws(s) URL, got {:?}",
                self.ws_base
            )));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConsoleError::Config("server.client_id is empty".into()));
        }
        Ok(())
    }
}

/// Per-conversation transport endpoint.
pub fn chat_url(ws_base: &str, session_id: &str, agent_id: &str) -> String {
    format!(
        "{}/ws/chat/{}/{}",
        ws_base.trim_end_matches('/'),
        session_id,
        agent_id
    )
}

/// Agent notification endpoint.
pub fn notification_url(ws_base: &str, agent_id: &str) -> String {
    format!("{}/ws/agent/{}", ws_base.trim_end_matches('/'), agent_id)
}

// =============================================================================
// Directory layout (derived from --data-dir, not tunable via figment)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ConsoleDirs {
    pub data_dir: PathBuf,
}

impl ConsoleDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".agent-console"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_timing_defaults() {
        let t = Timing::default();
        assert_eq!(t.switch_delay, Duration::from_millis(150));
        assert_eq!(t.end_chat_settle, Duration::from_secs(1));
        assert_eq!(t.reconnect_delay, Duration::from_secs(3));
        assert_eq!(t.notification_backoff, Duration::from_secs(5));
        assert_eq!(t.stale_visitor, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_stale_zero_disables() {
        let fc = TimingFileConfig {
            stale_visitor_secs: 0,
            ..Default::default()
        };
        assert!(Timing::from_file(&fc).stale_visitor.is_none());
    }

    #[test]
    fn test_console_config_strips_trailing_slash() {
        let fc = FileConfig {
            server: ServerFileConfig {
                http_base: "https://chat.example.com/api/".into(),
                ws_base: "wss://chat.example.com/".into(),
                client_id: "acme".into(),
            },
            timing: TimingFileConfig::default(),
        };
        let cc = ConsoleConfig::from_file(&fc);
        assert_eq!(cc.http_base, "https://chat.example.com/api");
        assert_eq!(cc.ws_base, "wss://chat.example.com");
        assert_eq!(cc.client_id, "acme");
    }

    #[test]
    fn test_validate_rejects_wrong_schemes() {
        assert!(ConsoleConfig::default().validate().is_ok());

        let mut cc = ConsoleConfig::default();
        cc.ws_base = "http://127.0.0.1:8000".into();
        let err = cc.validate().unwrap_err();
        assert_eq!(err.error_code(), "config");

        let mut cc = ConsoleConfig::default();
        cc.client_id = " ".into();
        assert!(cc.validate().is_err());
    }

    // ── endpoints ───────────────────────────────────────────────────────

    #[test]
    fn test_chat_url() {
        assert_eq!(
            chat_url("ws://127.0.0.1:8000/", "S1", "A1"),
            "ws://127.0.0.1:8000/ws/chat/S1/A1"
        );
        let cc = ConsoleConfig::default();
        assert_eq!(cc.chat_url("S1", "A1"), "ws://127.0.0.1:8000/ws/chat/S1/A1");
    }

    #[test]
    fn test_notification_url() {
        assert_eq!(
            notification_url("wss://chat.example.com", "A1"),
            "wss://chat.example.com/ws/agent/A1"
        );
    }

    // ── ConsoleDirs ─────────────────────────────────────────────────────

    #[test]
    fn test_console_dirs_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("nested");
        let dirs = ConsoleDirs::new(Some(nested.clone())).unwrap();
        assert_eq!(dirs.data_dir, nested);
        assert!(nested.exists());
        assert_eq!(dirs.config_toml_path(), nested.join("config.toml"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.client_id, "default");
        assert_eq!(fc.timing.switch_delay_ms, 150);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nclient_id = \"acme\"\n\n[timing]\nreconnect_delay_ms = 250\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.client_id, "acme");
        assert_eq!(fc.server.http_base, "http://127.0.0.1:8000");
        assert_eq!(fc.timing.reconnect_delay_ms, 250);
        assert_eq!(fc.timing.end_chat_settle_ms, 1000);
    }
}
