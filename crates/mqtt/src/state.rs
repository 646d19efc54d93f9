//! Connection state as observed through the kernel's `watch` channel.

use std::fmt;

/// Current state of the broker connection.
///
/// ```text
/// Connecting -> Connected -> Disconnected -> Reconnecting -> Connecting ...
///                                  \
///                                   -> Stopped   (fatal error or shutdown)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// CONNECT sent, waiting for CONNACK.
    Connecting,

    /// CONNACK received; subscriptions and publishes are live.
    Connected,

    /// Connection lost, with the reason.
    Disconnected(String),

    /// Waiting the given number of seconds before the next attempt.
    Reconnecting(f64),

    /// The kernel has exited and will not reconnect.
    Stopped(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Stopped(_) => "Stopped",
        }
    }

    pub fn details(&self) -> String {
        match self {
            ConnectionState::Connecting | ConnectionState::Connected => String::new(),
            ConnectionState::Disconnected(reason) | ConnectionState::Stopped(reason) => {
                reason.clone()
            }
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
