//! The borrowed connection facade.
//!
//! A [`Connection`] is exclusively owned by whoever borrowed it from the
//! [`ConnectionPool`](crate::ConnectionPool). Dropping it returns the
//! underlying transport to the pool unless the transport can no longer be
//! trusted to be in sync with the store.

use crate::cmd::{Args, Command, ToArg};
use crate::pool::Shared;
use crate::reply::FromReply;
use crate::scan::{self, ScanStream};
use crate::shutdown::Shutdown;
use crate::transport::Transport;
use crate::{latency, lock, Conn, Error, Frame, HashFields, Lock, Result, TransactionBatch};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tracing::{debug, instrument};

pub struct Connection {
    /// Always `Some` until the connection is dropped.
    transport: Option<Transport>,

    pool: Arc<Shared>,

    _permit: OwnedSemaphorePermit,

    /// Commands sent whose replies have not been read yet.
    pending: usize,

    /// Set while a read or write is in progress and kept after a transport
    /// failure. A broken connection is closed instead of being returned.
    broken: bool,
}

impl Connection {
    pub(crate) fn new(pool: Arc<Shared>, transport: Transport, permit: OwnedSemaphorePermit) -> Connection {
        Connection {
            transport: Some(transport),
            pool,
            _permit: permit,
            pending: 0,
            broken: false,
        }
    }

    /// Close the underlying transport instead of returning it to the pool.
    pub fn close(mut self) {
        self.broken = true;
    }

    /// Hand out the transport for one read or write. The connection stays
    /// marked broken until the call completes, so a call cancelled midway
    /// leaves it broken.
    fn begin_io(&mut self) -> Result<&mut Transport> {
        if self.broken {
            return Err(Error::ConnectionReset);
        }
        self.broken = true;
        self.transport.as_mut().ok_or(Error::ConnectionReset)
    }

    fn end_io<T>(&mut self, res: &Result<T>) {
        self.broken = matches!(res, Err(err) if err.is_fatal());
    }

    async fn round_trip(&mut self, cmd: &Command) -> Result<Frame> {
        self.send(cmd).await?;
        self.flush().await?;

        // Replies to earlier pipelined sends come first. The first error
        // reply among them wins.
        let mut first_error = None;
        let mut reply = Frame::Null;
        while self.pending > 0 {
            reply = self.read_raw().await?;
            if let Frame::Error(msg) = &reply {
                first_error.get_or_insert_with(|| msg.clone());
            }
        }

        match first_error {
            Some(msg) => Err(Error::Server(msg)),
            None => Ok(reply),
        }
    }

    /// Run `cmd` and convert its reply.
    pub async fn query<T: FromReply>(&mut self, cmd: &Command) -> Result<T> {
        T::from_reply(self.do_command(cmd).await?)
    }

    async fn read_raw(&mut self) -> Result<Frame> {
        let res = self.begin_io()?.read_reply().await;
        self.end_io(&res);

        let frame = res?;
        self.pending = self.pending.saturating_sub(1);
        debug!(response = ?frame);
        Ok(frame)
    }

    // Scalar operations

    #[instrument(skip(self))]
    pub async fn del(&mut self, keys: &[&str]) -> Result<i64> {
        self.query(&Command::with_args("DEL", Args::new().add_flat(keys)))
            .await
    }

    #[instrument(skip(self))]
    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        self.query(&Command::new("EXISTS").arg(key)).await
    }

    /// `GET` as an integer; a missing key reads as zero.
    #[instrument(skip(self))]
    pub async fn get_int64(&mut self, key: &str) -> Result<i64> {
        match self.get_int64_no_default(key).await {
            Err(Error::Nil) => Ok(0),
            res => res,
        }
    }

    /// `GET` as an integer; a missing key is `Error::Nil`.
    pub async fn get_int64_no_default(&mut self, key: &str) -> Result<i64> {
        self.query(&Command::new("GET").arg(key)).await
    }

    /// `GET` as a string; a missing key reads as the empty string.
    #[instrument(skip(self))]
    pub async fn get_string(&mut self, key: &str) -> Result<String> {
        let value: Option<String> = self.query(&Command::new("GET").arg(key)).await?;
        Ok(value.unwrap_or_default())
    }

    /// One `GET` per key inside a single transaction.
    #[instrument(skip(self))]
    pub async fn get_strings(&mut self, keys: &[&str]) -> Result<Vec<String>> {
        let mut batch = TransactionBatch::new();
        for key in keys {
            batch.push(Command::new("GET").arg(key));
        }

        batch
            .exec(self)
            .await?
            .into_iter()
            .map(|frame| Option::<String>::from_reply(frame).map(Option::unwrap_or_default))
            .collect()
    }

    /// `MGET`; missing keys read as empty strings.
    pub async fn mget_strings(&mut self, keys: &[&str]) -> Result<Vec<String>> {
        self.query(&Command::with_args("MGET", Args::new().add_flat(keys)))
            .await
    }

    pub async fn set_string(&mut self, key: &str, value: &str) -> Result<String> {
        self.query(&Command::new("SET").arg(key).arg(value)).await
    }

    /// `SET key value EX seconds`
    #[instrument(skip(self, value))]
    pub async fn set_string_ttl(&mut self, key: &str, value: &str, ttl: Duration) -> Result<String> {
        let cmd = Command::new("SET").arg(key).arg(value).arg("EX").arg(ttl.as_secs());
        self.query(&cmd).await
    }

    /// `SET key value EX seconds` for each pair, inside one transaction.
    /// Returns the per-command results.
    #[instrument(skip_all)]
    pub async fn set_strings_ttl(&mut self, entries: &[(&str, &str)], ttl: Duration) -> Result<Vec<Frame>> {
        let mut batch = TransactionBatch::new();
        for (key, value) in entries {
            batch.push(Command::new("SET").arg(key).arg(value).arg("EX").arg(ttl.as_secs()));
        }

        batch.exec(self).await
    }

    /// `SET key value EX seconds NX`. Returns `true` when the key was set.
    #[instrument(skip(self, value))]
    pub async fn set_if_not_exists_ttl_string(&mut self, key: &str, value: &str, ttl_seconds: i64) -> Result<bool> {
        let cmd = Command::new("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .arg("NX");
        let reply: Option<String> = self.query(&cmd).await?;
        Ok(reply.is_some())
    }

    /// `SETNX` followed by `EXPIRE`, inside one transaction.
    ///
    /// The expiry is refreshed even when the key already existed.
    #[instrument(skip(self))]
    pub async fn set_if_not_exists_ttl_int64(&mut self, key: &str, value: i64, ttl_seconds: i64) -> Result<()> {
        TransactionBatch::new()
            .add(Command::new("SETNX").arg(key).arg(value))
            .add(Command::expire(key, ttl_seconds))
            .exec(self)
            .await?;
        Ok(())
    }

    pub async fn set_int64(&mut self, key: &str, value: i64) -> Result<()> {
        self.do_command(&Command::new("SET").arg(key).arg(value)).await?;
        Ok(())
    }

    pub async fn set_int64_ttl(&mut self, key: &str, value: i64, ttl_seconds: i64) -> Result<()> {
        let cmd = Command::new("SET").arg(key).arg(value).arg("EX").arg(ttl_seconds);
        self.do_command(&cmd).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn increment_by(&mut self, key: &str, increment: i64) -> Result<i64> {
        self.query(&Command::new("INCRBY").arg(key).arg(increment)).await
    }

    /// `INCR` followed by `EXPIRE`, inside one transaction.
    #[instrument(skip(self))]
    pub async fn increment_and_expire(&mut self, key: &str, ttl: Duration) -> Result<()> {
        TransactionBatch::new()
            .add(Command::incr(key))
            .add(Command::expire(key, duration_secs(ttl)))
            .exec(self)
            .await?;
        Ok(())
    }

    /// `KEYS pattern`
    pub async fn list_keys(&mut self, pattern: &str) -> Result<Vec<String>> {
        self.query(&Command::new("KEYS").arg(pattern)).await
    }

    /// Remaining time to live in seconds; `-1` for a key without expiry and
    /// `-2` for a missing key.
    #[instrument(skip(self))]
    pub async fn ttl(&mut self, key: &str) -> Result<i64> {
        self.query(&Command::new("TTL").arg(key)).await
    }

    /// Iterate the keys matching `pattern` with `SCAN`, in pages of about
    /// `count` keys.
    ///
    /// The connection moves into a background task that streams keys until
    /// the store reports the terminal cursor, an error occurs, or `shutdown`
    /// fires. See [`ScanStream`].
    pub fn scan(self, pattern: &str, count: usize, shutdown: Shutdown) -> ScanStream {
        scan::spawn(self, pattern.to_string(), count, shutdown)
    }

    // Lock operations

    /// Try once to take the lock at `key` for `ttl`. `None` means the lock
    /// was not acquired, whether it is held elsewhere or the store could not
    /// be reached.
    pub async fn acquire_lock(&mut self, key: &str, ttl: Duration) -> Option<Lock> {
        lock::acquire(self, key, ttl).await
    }

    /// Try up to `max_retries` times, sleeping `pause` between attempts.
    /// Returns `None` as soon as `shutdown` fires.
    pub async fn acquire_lock_with_retries(
        &mut self,
        shutdown: &mut Shutdown,
        key: &str,
        ttl: Duration,
        max_retries: usize,
        pause: Duration,
    ) -> Option<Lock> {
        lock::acquire_with_retries(self, shutdown, key, ttl, max_retries, pause).await
    }

    // List operations

    pub async fn rpush<V: ToArg>(&mut self, key: &str, value: V) -> Result<i64> {
        self.query(&Command::new("RPUSH").arg(key).arg(value)).await
    }

    /// `RPUSH` followed by `EXPIRE`, inside one transaction. Fails when the
    /// push reports an empty list.
    #[instrument(skip(self))]
    pub async fn rpush_ttl(&mut self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        let results = TransactionBatch::new()
            .add(Command::new("RPUSH").arg(key).arg(member))
            .add(Command::expire(key, duration_secs(ttl)))
            .exec(self)
            .await?;

        let results = results
            .into_iter()
            .map(i64::from_reply)
            .collect::<Result<Vec<_>>>()?;

        match results.as_slice() {
            [0, _] => Err(Error::Protocol(format!("failed to push member onto {}", key))),
            [_, _] => Ok(true),
            _ => Err(Error::Protocol(format!(
                "expected 2 transaction results, got {}",
                results.len()
            ))),
        }
    }

    pub async fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.query(&Command::new("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    /// `LINDEX`; an out-of-range index reads as the empty string.
    pub async fn lindex_string(&mut self, key: &str, index: i64) -> Result<String> {
        let value: Option<String> = self.query(&Command::new("LINDEX").arg(key).arg(index)).await?;
        Ok(value.unwrap_or_default())
    }

    // Set operations

    pub async fn sadd<V: ToArg>(&mut self, key: &str, members: &[V]) -> Result<i64> {
        self.query(&Command::with_args("SADD", Args::new().add(key).add_flat(members)))
            .await
    }

    // Sorted-set operations

    /// `ZADD key NX score member ...`: members already in the set keep their
    /// score.
    #[instrument(skip(self))]
    pub async fn zadd(&mut self, key: &str, members: &[(i64, &str)]) -> Result<i64> {
        let mut args = Args::new().add(key).add("NX");
        for (score, member) in members {
            args.push(score);
            args.push(member);
        }
        self.query(&Command::with_args("ZADD", args)).await
    }

    pub async fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.query(&Command::new("ZRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    /// Score of `member`; `Error::Nil` when it is not in the set.
    pub async fn zscore(&mut self, key: &str, member: &str) -> Result<i64> {
        self.query(&Command::new("ZSCORE").arg(key).arg(member)).await
    }

    /// Scores of `members`, zero for those not in the set.
    pub async fn zmscore(&mut self, key: &str, members: &[&str]) -> Result<Vec<i64>> {
        self.query(&Command::with_args("ZMSCORE", Args::new().add(key).add_flat(members)))
            .await
    }

    pub async fn zcard(&mut self, key: &str) -> Result<i64> {
        self.query(&Command::new("ZCARD").arg(key)).await
    }

    /// Whether `member` is in the set, including members scored zero.
    pub async fn zexist(&mut self, key: &str, member: &str) -> Result<bool> {
        match self.zscore(key, member).await {
            Ok(_) => Ok(true),
            Err(Error::Nil) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// `ZRANDMEMBER key count`
    pub async fn zrandom(&mut self, key: &str, count: i64) -> Result<Vec<String>> {
        self.query(&Command::new("ZRANDMEMBER").arg(key).arg(count))
            .await
    }

    pub async fn zremove(&mut self, key: &str, members: &[&str]) -> Result<()> {
        self.do_command(&Command::with_args("ZREM", Args::new().add(key).add_flat(members)))
            .await?;
        Ok(())
    }

    /// Members scored within `[min, max]`. A `min` of 0 counts from `-inf`
    /// and a `max` of -1 counts up to `+inf`.
    pub async fn zcount(&mut self, key: &str, min: i64, max: i64) -> Result<i64> {
        let min = if min == 0 { "-inf".to_string() } else { min.to_string() };
        let max = if max == -1 { "+inf".to_string() } else { max.to_string() };
        self.query(&Command::new("ZCOUNT").arg(key).arg(min).arg(max))
            .await
    }

    // Hash operations

    pub async fn get_all_strings_hash(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.query(&Command::new("HGETALL").arg(key)).await
    }

    pub async fn get_float64_hash(&mut self, key: &str) -> Result<HashMap<String, f64>> {
        self.query(&Command::new("HGETALL").arg(key)).await
    }

    /// Read a hash into `T`. A hash with no fields is `Error::KeyNotFound`.
    #[instrument(skip(self))]
    pub async fn get_struct_hash<T: HashFields>(&mut self, key: &str) -> Result<T> {
        let fields: HashMap<String, Bytes> = self.query(&Command::new("HGETALL").arg(key)).await?;
        if fields.is_empty() {
            return Err(Error::KeyNotFound);
        }
        T::from_fields(fields)
    }

    /// `HKEYS key`
    pub async fn list_fields(&mut self, key: &str) -> Result<Vec<String>> {
        self.query(&Command::new("HKEYS").arg(key)).await
    }

    #[instrument(skip(self, value))]
    pub async fn set_hash<T: HashFields>(&mut self, key: &str, value: &T) -> Result<()> {
        self.do_command(&Command::hset(key, value.to_fields())).await?;
        Ok(())
    }

    /// One `HSETNX` per field, inside one transaction. Each result is 1 when
    /// the field was written and 0 when it already existed.
    #[instrument(skip(self, value))]
    pub async fn set_nx_hash<T: HashFields>(&mut self, key: &str, value: &T) -> Result<Vec<Frame>> {
        let mut batch = TransactionBatch::new();
        for (field, data) in value.to_fields() {
            batch.push(Command::new("HSETNX").arg(key).arg(field).arg(data));
        }

        batch.exec(self).await
    }

    /// `HSET` followed by `EXPIRE ... NX`, inside one transaction: an
    /// existing expiry is left untouched.
    #[instrument(skip(self, value))]
    pub async fn set_hash_ttl<T: HashFields>(&mut self, key: &str, value: &T, ttl: Duration) -> Result<Vec<Frame>> {
        TransactionBatch::new()
            .add(Command::hset(key, value.to_fields()))
            .add(Command::expire(key, duration_secs(ttl)).arg("NX"))
            .exec(self)
            .await
    }

    /// Returns the value after the increment.
    pub async fn increment_by_hash(&mut self, key: &str, field: &str, increment: i64) -> Result<i64> {
        self.query(&Command::hincrby(key, field, increment)).await
    }

    // Batches and raw access

    /// Execute `commands` as a single transaction, discarding the results.
    #[instrument(skip_all, fields(commands = commands.len()))]
    pub async fn exec(&mut self, commands: &[Command]) -> Result<()> {
        let mut batch = TransactionBatch::new();
        for cmd in commands {
            batch.push(cmd.clone());
        }
        batch.exec(self).await?;
        Ok(())
    }

    /// `MEMORY STATS`, keyed by statistic name.
    pub async fn memory_stats(&mut self) -> Result<HashMap<String, Frame>> {
        let values: Vec<Frame> = self.query(&Command::new("MEMORY").arg("STATS")).await?;

        let mut stats = HashMap::with_capacity(values.len() / 2);
        let mut iter = values.into_iter();
        while let Some(name) = iter.next() {
            let name = match name {
                Frame::Bulk(data) => String::from_utf8(data.to_vec()).map_err(|_| {
                    Error::Protocol("invalid utf-8 in memory stats name".to_string())
                })?,
                Frame::Simple(name) => name,
                frame => {
                    return Err(Error::Protocol(format!(
                        "unexpected memory stats name {}",
                        frame
                    )))
                }
            };
            let value = iter.next().ok_or_else(|| {
                Error::Protocol(format!("memory stats entry {} has no value", name))
            })?;
            stats.insert(name, value);
        }

        Ok(stats)
    }

    /// Flush commands queued with [`Conn::send`] and read `n` replies as
    /// strings. Nil replies read as empty strings.
    pub async fn receive_strings(&mut self, n: usize) -> Result<Vec<String>> {
        self.flush().await?;

        let mut replies = Vec::with_capacity(n);
        for _ in 0..n {
            let reply: Option<String> = FromReply::from_reply(self.receive().await?)?;
            replies.push(reply.unwrap_or_default());
        }
        Ok(replies)
    }

    /// Returns the number of subscribers that received the message.
    #[instrument(skip(self, message))]
    pub async fn publish<M: ToArg>(&mut self, channel: &str, message: M) -> Result<i64> {
        self.query(&Command::new("PUBLISH").arg(channel).arg(message))
            .await
    }

    /// `PING`, returning the server's reply text.
    pub async fn ping(&mut self) -> Result<String> {
        self.query(&Command::new("PING")).await
    }
}

impl Conn for Connection {
    async fn send(&mut self, cmd: &Command) -> Result<()> {
        debug!(request = ?cmd);
        let res = self.begin_io()?.send(cmd).await;
        self.end_io(&res);

        res?;
        self.pending += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let res = self.begin_io()?.flush().await;
        self.end_io(&res);
        res
    }

    async fn receive(&mut self) -> Result<Frame> {
        match self.read_raw().await? {
            Frame::Error(msg) => Err(Error::Server(msg)),
            frame => Ok(frame),
        }
    }

    async fn drain(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        self.flush().await?;

        let mut first_error = None;
        while self.pending > 0 {
            if let Frame::Error(msg) = self.read_raw().await? {
                first_error.get_or_insert(msg);
            }
        }

        match first_error {
            Some(msg) => Err(Error::Server(msg)),
            None => Ok(()),
        }
    }

    async fn do_command(&mut self, cmd: &Command) -> Result<Frame> {
        let started = Instant::now();
        let res = self.round_trip(cmd).await;
        latency::record(cmd.name(), started.elapsed());
        res
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };

        if self.broken || self.pending > 0 {
            drop(transport);
            self.pool.discard();
        } else {
            self.pool.put(transport);
        }
    }
}

fn duration_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}
