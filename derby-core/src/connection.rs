//! Connection state machine for the timing controller status stream.
//!
//! Pure state and timing bookkeeping, no I/O. The hardware link actor in the
//! server drives it from socket events and a periodic staleness check:
//!
//! ```text
//!                start_connecting()          connected()
//!  Disconnected ───────────────────► Connecting ───────────► Connected
//!       ▲                               ▲    │                │   │
//!       │              start_connecting()    │ error()  error()   │
//!       │                               │    ▼                │   │
//!       │                               Error ◄───────────────┘   │
//!       └──────────────── dropped() (stale or closed) ────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use derby_core::connection::{ConnectionManager, ConnectionState};
//!
//! let mut conn = ConnectionManager::new();
//! conn.start_connecting();
//! conn.connected(100);
//! conn.data_received(150);
//! assert!(!conn.is_stale(2000));
//! assert!(conn.is_stale(2200));
//! assert_eq!(conn.state(), ConnectionState::Connected);
//! ```

use serde::{Deserialize, Serialize};

/// Silence on the status stream longer than this means the link is dead.
pub const STALE_TIMEOUT_MS: u64 = 2000;

/// How often the staleness watchdog looks at the link.
pub const STALE_CHECK_INTERVAL_MS: u64 = 500;

/// Fixed delay before a reconnect attempt.
pub const RECONNECT_DELAY_MS: u64 = 3000;

/// Connection state of the status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected, no attempt in progress
    Disconnected,
    /// WebSocket handshake in progress
    Connecting,
    /// Stream open
    Connected,
    /// Last attempt or stream failed, a reconnect follows
    Error,
    /// Link stopped, no more attempts
    ShuttingDown,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error => write!(f, "Error"),
            ConnectionState::ShuttingDown => write!(f, "Shutting Down"),
        }
    }
}

/// Tracks link state, failures and the time of the last status message.
///
/// Times are milliseconds on any monotonic clock the caller chooses.
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    state: ConnectionState,
    failure_count: u32,
    /// Time of the last message, or of the connect when none arrived yet
    last_data_ms: Option<u64>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Delay before the next attempt. Fixed, no exponential growth.
    pub fn backoff_ms(&self) -> u64 {
        RECONNECT_DELAY_MS
    }

    pub fn time_since_data_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_data_ms.map(|t| now_ms.saturating_sub(t))
    }

    /// Connected, but nothing has arrived for longer than [`STALE_TIMEOUT_MS`].
    ///
    /// The clock starts at the connect, so a stream that opens and never
    /// sends anything goes stale too.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        self.is_connected()
            && self
                .time_since_data_ms(now_ms)
                .map(|silence| silence > STALE_TIMEOUT_MS)
                .unwrap_or(false)
    }

    pub fn start_connecting(&mut self) {
        if self.state != ConnectionState::ShuttingDown {
            self.state = ConnectionState::Connecting;
        }
    }

    pub fn connected(&mut self, now_ms: u64) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            self.failure_count = 0;
            self.last_data_ms = Some(now_ms);
        }
    }

    /// Any message counts, whatever its type.
    pub fn data_received(&mut self, now_ms: u64) {
        if self.state == ConnectionState::Connected {
            self.last_data_ms = Some(now_ms);
        }
    }

    pub fn error(&mut self) {
        if self.state != ConnectionState::ShuttingDown {
            self.state = ConnectionState::Error;
            self.failure_count = self.failure_count.saturating_add(1);
            self.last_data_ms = None;
        }
    }

    /// Stream torn down on purpose (stale or closed by the peer).
    pub fn dropped(&mut self) {
        if self.state != ConnectionState::ShuttingDown {
            self.state = ConnectionState::Disconnected;
            self.last_data_ms = None;
        }
    }

    pub fn shutdown(&mut self) {
        self.state = ConnectionState::ShuttingDown;
        self.last_data_ms = None;
    }

    /// Back to a clean Disconnected state, also out of ShuttingDown.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.failure_count = 0;
        self.last_data_ms = None;
    }
}
