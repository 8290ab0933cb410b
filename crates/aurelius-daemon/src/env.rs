use std::time::Duration;

/// Daemon-wide tunables the environment provides at startup. These are read once and copied into every peer; there is no live reload for
/// them.
#[derive(Debug, Clone, Copy)]
pub struct Environment {
    /// When set, a single failed outbound connection attempt terminates the peer instead of re-arming the back-off.
    pub tcp_once: bool,

    /// How long a half-session may wait for the peer's OPEN before the handshake is declared stuck.
    pub open_wait: Duration,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            tcp_once: false,
            open_wait: Duration::from_secs(60),
        }
    }
}
