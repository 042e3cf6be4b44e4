//! Connection configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::h2_codec::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE};

/// Connection-level receive window. Fixed independently of the per-stream
/// window because every stream on the connection shares it.
pub const CONNECTION_WINDOW_SIZE: u32 = 64 * 1024 * 1024;

/// When keepalive PINGs are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepAlivePolicy {
    /// Only while at least one stream is open.
    #[default]
    WithActiveRequests,
    /// Whenever the connection is idle, streams or not.
    Always,
}

/// Tunables for one HTTP/2 connection.
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Advertised SETTINGS_INITIAL_WINDOW_SIZE; each stream's receive window.
    pub initial_stream_window_size: u32,
    /// Connection receive window reached by the setup WINDOW_UPDATE.
    pub connection_window_size: u32,
    /// Idle time before a keepalive PING. `None` disables keepalive.
    pub keep_alive_ping_delay: Option<Duration>,
    pub keep_alive_ping_timeout: Duration,
    pub keep_alive_policy: KeepAlivePolicy,
    /// Send RTT-measuring PINGs when data arrives.
    pub rtt_probes: bool,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_stream_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            connection_window_size: CONNECTION_WINDOW_SIZE,
            keep_alive_ping_delay: None,
            keep_alive_ping_timeout: Duration::from_secs(20),
            keep_alive_policy: KeepAlivePolicy::default(),
            rtt_probes: true,
        }
    }
}

impl Http2Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_stream_window_size(mut self, size: u32) -> Self {
        self.initial_stream_window_size = size;
        self
    }

    pub fn with_connection_window_size(mut self, size: u32) -> Self {
        self.connection_window_size = size;
        self
    }

    pub fn with_keep_alive(mut self, delay: Duration, timeout: Duration, policy: KeepAlivePolicy) -> Self {
        self.keep_alive_ping_delay = Some(delay);
        self.keep_alive_ping_timeout = timeout;
        self.keep_alive_policy = policy;
        self
    }

    pub fn with_rtt_probes(mut self, enabled: bool) -> Self {
        self.rtt_probes = enabled;
        self
    }

    /// Accumulated received bytes that trigger a connection WINDOW_UPDATE.
    pub fn connection_window_threshold(&self) -> i32 {
        (self.connection_window_size / 8) as i32
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_stream_window_size > MAX_WINDOW_SIZE {
            return Err(Error::InvalidRequest(format!(
                "initial stream window {} exceeds {}",
                self.initial_stream_window_size, MAX_WINDOW_SIZE
            )));
        }
        if !(DEFAULT_INITIAL_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.connection_window_size) {
            return Err(Error::InvalidRequest(format!(
                "connection window {} must be within [{}, {}]",
                self.connection_window_size, DEFAULT_INITIAL_WINDOW_SIZE, MAX_WINDOW_SIZE
            )));
        }
        Ok(())
    }
}
