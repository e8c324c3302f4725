//! Coordination primitives over a remote key/value store speaking RESP2.
//!
//! The major components are:
//! * `pool`: a bounded pool of authenticated connections, dialed with retry.
//! * `connection`: the borrowed connection facade with typed operations.
//! * `lock`: token-based mutual exclusion with atomic release.
//! * `pubsub`: a liveness-monitored subscription loop and a publisher.
//! * `transaction`: `MULTI` / `EXEC` batches.
//! * `script`: server-side scripts invoked by digest.
//! * `scan`: cursor iteration streamed from a background task.
//! * `cmd`: commands and their arguments.
//! * `frame`: represents a single protocol frame.

#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

pub mod cmd;
pub use cmd::{Args, Command, ToArg};

mod config;
pub use config::{PoolConfig, HEALTH_CHECK_PERIOD};

mod conn;
pub use conn::Conn;

mod connection;
pub use connection::Connection;

mod dial;

mod error;
pub use error::{Error, Result};

pub mod frame;
pub use frame::Frame;

pub mod hash;
pub use hash::HashFields;

mod health;
pub use health::{HealthRecorder, NoopHealth, HEALTH_SOURCE};

mod latency;
pub use latency::REQUEST_LATENCY;

pub mod lock;
pub use lock::Lock;

mod parse;

mod pool;
pub use pool::{ConnectionPool, PoolStats};

mod pubsub;
pub use pubsub::{PubSubHandler, Publisher};

mod reply;
pub use reply::FromReply;

mod scan;
pub use scan::ScanStream;

mod script;
pub use script::Script;

pub mod shutdown;
pub use shutdown::{Shutdown, ShutdownSignal};

mod tls;

mod transaction;
pub use transaction::TransactionBatch;

mod transport;

/// Default port that the store listens on.
pub const DEFAULT_PORT: u16 = 6379;
