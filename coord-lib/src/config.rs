use crate::{Error, Result, DEFAULT_PORT};
use std::fmt;
use std::time::Duration;

/// A ping is sent on pub/sub connections with this period to test the health
/// of the connection and the server.
pub const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Settings consumed by [`ConnectionPool::start`](crate::ConnectionPool::start).
/// Immutable once the pool has started.
#[derive(Clone)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    pub database: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Legacy credential sent as a separate `AUTH` right after dialing.
    pub auth_code: Option<String>,
    pub use_tls: bool,
    /// Skip server certificate verification.
    pub tls_insecure: bool,
    /// Maximum number of idle connections kept for reuse.
    pub max_idle: usize,
    /// Maximum number of connections borrowed at once. `0` means unbounded.
    pub max_active: usize,
    /// Idle connections older than this are closed instead of reused.
    /// `Duration::ZERO` disables the check.
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Must exceed `ping_period` so a missing pong surfaces as a timeout.
    pub read_timeout: Duration,
    pub ping_period: Duration,
    /// Total time spent retrying a failing dial.
    pub dial_retry_window: Duration,
    pub dial_retry_pause: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: 0,
            username: None,
            password: None,
            auth_code: None,
            use_tls: false,
            tls_insecure: false,
            max_idle: 8,
            max_active: 32,
            idle_timeout: Duration::from_secs(240),
            connect_timeout: Duration::from_secs(30),
            read_timeout: HEALTH_CHECK_PERIOD + Duration::from_secs(10),
            ping_period: HEALTH_CHECK_PERIOD,
            dial_retry_window: Duration::from_secs(10),
            dial_retry_pause: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// `host:port`, falling back to `localhost:6379` for an empty host.
    pub fn addr(&self) -> String {
        let host = if self.host.is_empty() {
            "localhost"
        } else {
            self.host.as_str()
        };
        let port = if self.port == 0 { DEFAULT_PORT } else { self.port };

        format!("{}:{}", host, port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_timeout <= self.ping_period {
            return Err(Error::Config(format!(
                "read timeout {:?} must exceed the ping period {:?}",
                self.read_timeout, self.ping_period
            )));
        }
        if self.ping_period.is_zero() {
            return Err(Error::Config("ping period must be non-zero".to_string()));
        }
        if self.tls_insecure && !self.use_tls {
            return Err(Error::Config(
                "tls_insecure requires use_tls to be enabled".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("addr", &self.addr())
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth_code", &self.auth_code.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .field("tls_insecure", &self.tls_insecure)
            .field("max_idle", &self.max_idle)
            .field("max_active", &self.max_active)
            .field("idle_timeout", &self.idle_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("ping_period", &self.ping_period)
            .finish_non_exhaustive()
    }
}
