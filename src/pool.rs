//! The connection pool as seen from one connection.
//!
//! The pool creates and retires connections; a connection only reports its
//! lifecycle back and asks for origin details when serializing requests.

use http::Uri;
use tracing::debug;

/// Pool-side collaborator of an [`crate::Http2Connection`].
pub trait ConnectionPool: Send + Sync {
    /// Value of the `:authority` pseudo-header.
    fn authority(&self) -> &str;

    /// Whether the transport is secured; picks `:scheme`.
    fn is_secure(&self) -> bool;

    /// ASCII serialization of the origin (`https://host:port`), compared
    /// against ALTSVC frames on stream 0.
    fn origin(&self) -> String {
        let scheme = if self.is_secure() { "https" } else { "http" };
        format!("{}://{}", scheme, self.authority())
    }

    /// Cookies from a shared store for this request, already joined with "; ".
    fn cookie_header(&self, _uri: &Uri) -> Option<String> {
        None
    }

    fn on_connection_established(&self) {}

    fn on_connection_closed(&self) {}

    /// The connection must not be handed out for new requests anymore.
    fn invalidate_connection(&self) {}

    /// An ALTSVC frame applying to this origin.
    fn handle_alt_svc(&self, _field_value: &str) {}
}

/// Minimal pool bound to one origin. Lifecycle events are only logged.
#[derive(Debug, Clone)]
pub struct OriginPool {
    authority: String,
    secure: bool,
}

impl OriginPool {
    pub fn new(authority: impl Into<String>, secure: bool) -> Self {
        Self {
            authority: authority.into(),
            secure,
        }
    }
}

impl ConnectionPool for OriginPool {
    fn authority(&self) -> &str {
        &self.authority
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn on_connection_established(&self) {
        debug!(authority = %self.authority, "HTTP/2 connection established");
    }

    fn on_connection_closed(&self) {
        debug!(authority = %self.authority, "HTTP/2 connection closed");
    }

    fn invalidate_connection(&self) {
        debug!(authority = %self.authority, "HTTP/2 connection invalidated");
    }

    fn handle_alt_svc(&self, field_value: &str) {
        debug!(authority = %self.authority, alt_svc = field_value, "ALTSVC received");
    }
}
