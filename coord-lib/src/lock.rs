//! Single-instance distributed lock.
//!
//! A lock is a key holding a random token, written with `SET key token NX PX
//! ttl`. Only the holder of the token can release it: release runs a script
//! that deletes the key only if it still holds that token, so a lock that
//! expired and was taken by someone else is never deleted.

use crate::cmd::{Args, Command};
use crate::shutdown::Shutdown;
use crate::{Conn, Error, Frame, Result, Script};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

static RELEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        1,
        r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("del", KEYS[1]) else return 0 end"#,
    )
});

/// A held lock. Dropping it does not release it; the key expires on its own
/// after its time to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    key: String,
    token: String,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Delete the lock if this handle still holds it.
    ///
    /// Returns `Error::LockNotFound` when the key no longer holds this
    /// handle's token: the lock expired, possibly to be taken by someone
    /// else, or it was already released.
    #[instrument(skip(conn))]
    pub async fn release<C: Conn>(&self, conn: &mut C) -> Result<()> {
        let args = Args::new().add(&self.key).add(&self.token);
        match RELEASE.run_int(conn, &args).await? {
            0 => Err(Error::LockNotFound),
            1 => Ok(()),
            deleted => Err(Error::LockInvariant {
                key: self.key.clone(),
                deleted,
            }),
        }
    }
}

/// Try once to take the lock at `key` for `ttl`.
///
/// `None` when the key is already held, and also when the store could not be
/// reached; both mean the lock was not acquired.
#[instrument(skip(conn))]
pub async fn acquire<C: Conn>(conn: &mut C, key: &str, ttl: Duration) -> Option<Lock> {
    let token = Uuid::new_v4().to_string();
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let cmd = Command::new("SET")
        .arg(key)
        .arg(&token)
        .arg("NX")
        .arg("PX")
        .arg(millis);

    match conn.do_command(&cmd).await {
        Ok(Frame::Simple(reply)) if reply == "OK" => Some(Lock {
            key: key.to_string(),
            token,
        }),
        Ok(_) => {
            debug!("lock is held elsewhere");
            None
        }
        Err(err) => {
            warn!(cause = %err, "failed to acquire lock");
            None
        }
    }
}

/// Try up to `max_retries` times, pausing `pause` after each failed attempt.
///
/// The pause is fixed, with no backoff or jitter. Returns `None` without
/// exhausting the retries once `shutdown` fires.
#[instrument(skip(conn, shutdown))]
pub async fn acquire_with_retries<C: Conn>(
    conn: &mut C,
    shutdown: &mut Shutdown,
    key: &str,
    ttl: Duration,
    max_retries: usize,
    pause: Duration,
) -> Option<Lock> {
    for _ in 0..max_retries {
        if let Some(lock) = acquire(conn, key, ttl).await {
            return Some(lock);
        }

        tokio::select! {
            () = shutdown.recv() => return None,
            () = time::sleep(pause) => {}
        }
    }

    None
}
