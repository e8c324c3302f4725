use crate::cmd::{Args, Command};
use crate::reply::FromReply;
use crate::{Conn, Error, Frame, Result};
use sha1::{Digest, Sha1};
use tracing::debug;

/// A server-side Lua script.
///
/// Invocations go by the script's SHA1 digest first and resend the source
/// only when the store does not know the digest yet.
#[derive(Clone, Debug)]
pub struct Script {
    key_count: usize,
    src: String,
    hash: String,
}

impl Script {
    /// `key_count` is how many of the positional values passed on each
    /// invocation are keys; the rest are arguments.
    pub fn new(key_count: usize, src: impl Into<String>) -> Script {
        let src = src.into();
        let mut hasher = Sha1::new();
        hasher.update(src.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        Script {
            key_count,
            src,
            hash,
        }
    }

    /// The SHA1 digest the store identifies the script by.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Register the script ahead of time with `SCRIPT LOAD`.
    pub async fn load<C: Conn>(&self, conn: &mut C) -> Result<()> {
        let cmd = Command::new("SCRIPT").arg("LOAD").arg(&self.src);
        let hash = String::from_reply(conn.do_command(&cmd).await?)?;
        if hash != self.hash {
            return Err(Error::Protocol(format!(
                "store registered script as {}, expected {}",
                hash, self.hash
            )));
        }
        Ok(())
    }

    fn invocation(&self, name: &str, first: &str, keys_and_args: &Args) -> Command {
        Command::with_args(
            name,
            Args::new()
                .add(first)
                .add(self.key_count)
                .add_flat(keys_and_args),
        )
    }

    /// Evaluate the script and return its raw reply.
    ///
    /// Replies to earlier pipelined sends are consumed before the `EVALSHA`
    /// goes out, so only this invocation's own `NOSCRIPT` reply resends the
    /// source. An error reply among the earlier ones is still returned, after
    /// the script has run.
    pub async fn run<C: Conn>(&self, conn: &mut C, keys_and_args: &Args) -> Result<Frame> {
        let earlier = match conn.drain().await {
            Ok(()) => None,
            Err(Error::Server(msg)) => Some(msg),
            Err(err) => return Err(err),
        };

        let by_hash = self.invocation("EVALSHA", &self.hash, keys_and_args);
        let res = match conn.do_command(&by_hash).await {
            Err(Error::Server(msg)) if msg.starts_with("NOSCRIPT") => {
                debug!(hash = %self.hash, "script not cached, sending source");
                conn.do_command(&self.invocation("EVAL", &self.src, keys_and_args))
                    .await
            }
            res => res,
        };

        match earlier {
            Some(msg) => Err(Error::Server(msg)),
            None => res,
        }
    }

    pub async fn run_int<C: Conn>(&self, conn: &mut C, keys_and_args: &Args) -> Result<i64> {
        i64::from_reply(self.run(conn, keys_and_args).await?)
    }

    /// Evaluate a script returning a list of strings. The script signals a
    /// missing key by returning -1, reported as `Error::KeyNotFound`; any
    /// other integer reply is `Error::UnexpectedInteger`.
    pub async fn run_strings<C: Conn>(&self, conn: &mut C, keys_and_args: &Args) -> Result<Vec<String>> {
        match self.run(conn, keys_and_args).await? {
            Frame::Integer(-1) => Err(Error::KeyNotFound),
            Frame::Integer(v) => Err(Error::UnexpectedInteger(v)),
            frame => Vec::<String>::from_reply(frame),
        }
    }

    /// Queue an `EVALSHA` without waiting for the reply. The script must
    /// already be loaded.
    pub async fn send_hash<C: Conn>(&self, conn: &mut C, keys_and_args: &Args) -> Result<()> {
        conn.send(&self.invocation("EVALSHA", &self.hash, keys_and_args))
            .await
    }

    /// Queue an `EVAL` with the full source without waiting for the reply.
    pub async fn send<C: Conn>(&self, conn: &mut C, keys_and_args: &Args) -> Result<()> {
        conn.send(&self.invocation("EVAL", &self.src, keys_and_args))
            .await
    }
}
