//! Agent configuration and protocol timing.

use std::time::Duration;

/// Fixed delay before a reconnect attempt to the relay.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Upper bound on a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a dispatched request may wait for its response frame before the
/// client is answered with a gateway timeout.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(20000);

/// Settings for the managed relay connection.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
}

impl LinkConfig {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            connect_timeout: CONNECT_TIMEOUT,
            retry_delay: RECONNECT_DELAY,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
