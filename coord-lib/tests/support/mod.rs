//! An in-process fake store speaking RESP2 over a real TCP socket.
//!
//! It implements the subset of commands the library issues, with lazily
//! evaluated key expiry, `MULTI` / `EXEC` queueing, a handful of known
//! scripts and pub/sub fan-out between its connections.

#![allow(dead_code)]

use bytes::{Buf, Bytes, BytesMut};
use coord_lib::frame::{Frame, FrameError};
use coord_lib::{HealthRecorder, PoolConfig};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Returns -1 when `KEYS[1]` is missing, otherwise the whole list.
pub const LIST_OR_MISSING: &str =
    "if redis.call('exists', KEYS[1]) == 0 then return -1 end return redis.call('lrange', KEYS[1], 0, -1)";

pub const RETURN_SEVEN: &str = "return 7";

const LOCK_RELEASE_MARKER: &str = r#"redis.call("get", KEYS[1]) == ARGV[1]"#;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

const KNOWN: &[&str] = &[
    "GET", "SET", "SETNX", "DEL", "EXISTS", "INCR", "INCRBY", "EXPIRE", "TTL", "KEYS", "SCAN",
    "MGET", "HSET", "HMSET", "HGETALL", "HKEYS", "HSETNX", "HINCRBY", "HGET", "SADD", "ZADD",
    "ZRANGE", "ZSCORE", "ZMSCORE", "ZCARD", "ZREM", "ZCOUNT", "ZRANDMEMBER", "RPUSH", "LRANGE",
    "LINDEX", "EVAL", "EVALSHA", "SCRIPT", "PUBLISH", "MEMORY", "SELECT", "PING",
];

pub struct FakeStore {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    password: Option<String>,
    connections: AtomicUsize,
    silent_pongs: AtomicBool,
}

#[derive(Default)]
struct State {
    data: HashMap<String, Entry>,
    scripts: HashMap<String, String>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Frame>)>>,
    next_client: u64,
    log: Vec<String>,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

enum Value {
    Str(Bytes),
    Hash(BTreeMap<String, Bytes>),
    Set(BTreeSet<Bytes>),
    ZSet(BTreeMap<String, f64>),
    List(VecDeque<Bytes>),
}

impl FakeStore {
    pub async fn start() -> FakeStore {
        FakeStore::spawn(None).await
    }

    /// A store that rejects every command until `AUTH <password>`.
    pub async fn with_password(password: &str) -> FakeStore {
        FakeStore::spawn(Some(password.to_string())).await
    }

    async fn spawn(password: Option<String>) -> FakeStore {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            password,
            connections: AtomicUsize::new(0),
            silent_pongs: AtomicBool::new(false),
        });

        let accept = shared.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept.connections.fetch_add(1, Ordering::SeqCst);
                let shared = accept.clone();
                tokio::spawn(async move {
                    let _ = serve(shared, socket).await;
                });
            }
        });

        FakeStore { addr, shared }
    }

    /// Pool settings pointing at this store, with short retry timings.
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            dial_retry_window: Duration::from_millis(300),
            dial_retry_pause: Duration::from_millis(50),
            ..PoolConfig::default()
        }
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Stop answering liveness pings on subscribed connections.
    pub fn silence_pongs(&self) {
        self.shared.silent_pongs.store(true, Ordering::SeqCst);
    }

    /// Upper-cased names of every command received, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.shared.lock().log.clone()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.shared.lock().data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(Bytes::copy_from_slice(value.as_bytes())),
                expires_at: None,
            },
        );
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .lock()
            .subscribers
            .get(channel)
            .map_or(0, Vec::len)
    }
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Health reports, in order.
#[derive(Default)]
pub struct RecordingHealth {
    pub reports: Mutex<Vec<String>>,
}

impl HealthRecorder for RecordingHealth {
    fn report_healthy(&self, source: &str) {
        self.reports.lock().unwrap().push(format!("healthy:{}", source));
    }

    fn report_unhealthy(&self, source: &str, _reason: &str) {
        self.reports.lock().unwrap().push(format!("unhealthy:{}", source));
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

struct Session {
    id: u64,
    authenticated: bool,
    multi: Option<Vec<(String, Vec<Bytes>)>>,
    multi_failed: bool,
    subscriptions: Vec<String>,
    push: mpsc::UnboundedSender<Frame>,
}

async fn serve(shared: Arc<Shared>, mut socket: TcpStream) -> io::Result<()> {
    let (push, mut pushes) = mpsc::unbounded_channel();
    let id = {
        let mut state = shared.lock();
        state.next_client += 1;
        state.next_client
    };
    let mut session = Session {
        id,
        authenticated: shared.password.is_none(),
        multi: None,
        multi_failed: false,
        subscriptions: Vec::new(),
        push,
    };
    let mut buf = BytesMut::with_capacity(4096);

    let res: io::Result<()> = async {
        loop {
            let mut out = Vec::new();
            while let Some(frame) = next_frame(&mut buf)? {
                for reply in session.handle(&shared, frame) {
                    encode(&reply, &mut out);
                }
            }
            if !out.is_empty() {
                socket.write_all(&out).await?;
            }

            tokio::select! {
                n = socket.read_buf(&mut buf) => {
                    if n? == 0 {
                        return Ok(());
                    }
                }
                Some(push) = pushes.recv() => {
                    let mut out = Vec::new();
                    encode(&push, &mut out);
                    socket.write_all(&out).await?;
                }
            }
        }
    }
    .await;

    session.unsubscribe_all(&shared);
    res
}

fn next_frame(buf: &mut BytesMut) -> io::Result<Option<Frame>> {
    let mut cursor = Cursor::new(&buf[..]);
    match Frame::check(&mut cursor) {
        Ok(()) => {
            let len = cursor.position() as usize;
            cursor.set_position(0);
            let frame = Frame::parse(&mut cursor)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            buf.advance(len);
            Ok(Some(frame))
        }
        Err(FrameError::Incomplete) => Ok(None),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

fn encode(frame: &Frame, out: &mut Vec<u8>) {
    match frame {
        Frame::Simple(s) => out.extend_from_slice(format!("+{}\r\n", s).as_bytes()),
        Frame::Error(s) => out.extend_from_slice(format!("-{}\r\n", s).as_bytes()),
        Frame::Integer(v) => out.extend_from_slice(format!(":{}\r\n", v).as_bytes()),
        Frame::Null => out.extend_from_slice(b"$-1\r\n"),
        Frame::Bulk(data) => {
            out.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        Frame::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode(item, out);
            }
        }
    }
}

impl Session {
    fn handle(&mut self, shared: &Shared, frame: Frame) -> Vec<Frame> {
        let mut args: Vec<Bytes> = match frame {
            Frame::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Frame::Bulk(data) => data,
                    Frame::Simple(s) => Bytes::from(s),
                    _ => Bytes::new(),
                })
                .collect(),
            _ => return vec![error("ERR protocol error")],
        };
        if args.is_empty() {
            return vec![error("ERR empty command")];
        }
        let name = String::from_utf8_lossy(&args.remove(0)).to_ascii_uppercase();
        shared.lock().log.push(name.clone());

        if name == "AUTH" {
            let given = args.last().map(|p| String::from_utf8_lossy(p).into_owned());
            return match (&shared.password, given) {
                (Some(expected), Some(given)) if *expected == given => {
                    self.authenticated = true;
                    vec![ok()]
                }
                (None, Some(_)) => vec![ok()],
                _ => vec![error("WRONGPASS invalid username-password pair")],
            };
        }
        if !self.authenticated {
            return vec![error("NOAUTH Authentication required.")];
        }

        match name.as_str() {
            "MULTI" => {
                self.multi = Some(Vec::new());
                self.multi_failed = false;
                vec![ok()]
            }
            "EXEC" => match self.multi.take() {
                None => vec![error("ERR EXEC without MULTI")],
                Some(_) if self.multi_failed => vec![error(
                    "EXECABORT Transaction discarded because of previous errors.",
                )],
                Some(queued) => {
                    let mut state = shared.lock();
                    let results = queued
                        .iter()
                        .map(|(name, args)| execute(&mut state, name, args))
                        .collect();
                    vec![Frame::Array(results)]
                }
            },
            _ if self.multi.is_some() => {
                if KNOWN.contains(&name.as_str()) {
                    if let Some(queue) = self.multi.as_mut() {
                        queue.push((name.clone(), args));
                    }
                    vec![Frame::Simple("QUEUED".to_string())]
                } else {
                    self.multi_failed = true;
                    vec![error(&format!("ERR unknown command '{}'", name))]
                }
            }
            "SUBSCRIBE" => self.subscribe(shared, &args),
            "UNSUBSCRIBE" => self.unsubscribe(shared, &args),
            "PING" if !self.subscriptions.is_empty() => {
                if shared.silent_pongs.load(Ordering::SeqCst) {
                    return Vec::new();
                }
                let data = args.first().cloned().unwrap_or_default();
                vec![Frame::Array(vec![bulk("pong"), Frame::Bulk(data)])]
            }
            _ => vec![execute(&mut shared.lock(), &name, &args)],
        }
    }

    fn subscribe(&mut self, shared: &Shared, args: &[Bytes]) -> Vec<Frame> {
        let mut state = shared.lock();
        let mut replies = Vec::new();
        for channel in args {
            let channel = String::from_utf8_lossy(channel).into_owned();
            if !self.subscriptions.contains(&channel) {
                self.subscriptions.push(channel.clone());
                state
                    .subscribers
                    .entry(channel.clone())
                    .or_default()
                    .push((self.id, self.push.clone()));
            }
            replies.push(subscription("subscribe", &channel, self.subscriptions.len()));
        }
        replies
    }

    fn unsubscribe(&mut self, shared: &Shared, args: &[Bytes]) -> Vec<Frame> {
        let targets: Vec<String> = if args.is_empty() {
            self.subscriptions.clone()
        } else {
            args.iter()
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect()
        };
        if targets.is_empty() {
            return vec![Frame::Array(vec![
                bulk("unsubscribe"),
                Frame::Null,
                Frame::Integer(0),
            ])];
        }

        let mut state = shared.lock();
        let mut replies = Vec::new();
        for channel in targets {
            self.subscriptions.retain(|c| *c != channel);
            if let Some(subscribers) = state.subscribers.get_mut(&channel) {
                subscribers.retain(|(id, _)| *id != self.id);
            }
            replies.push(subscription("unsubscribe", &channel, self.subscriptions.len()));
        }
        replies
    }

    fn unsubscribe_all(&mut self, shared: &Shared) {
        let mut state = shared.lock();
        for channel in self.subscriptions.drain(..) {
            if let Some(subscribers) = state.subscribers.get_mut(&channel) {
                subscribers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

fn subscription(kind: &str, channel: &str, count: usize) -> Frame {
    Frame::Array(vec![
        bulk(kind),
        bulk(channel),
        Frame::Integer(count as i64),
    ])
}

fn ok() -> Frame {
    Frame::Simple("OK".to_string())
}

fn error(msg: &str) -> Frame {
    Frame::Error(msg.to_string())
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn sha1_hex(src: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(src.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn execute(state: &mut State, name: &str, args: &[Bytes]) -> Frame {
    let now = Instant::now();
    state
        .data
        .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));

    match run(state, name, args) {
        Ok(frame) => frame,
        Err(msg) => Frame::Error(msg),
    }
}

type Reply = Result<Frame, String>;

fn text(args: &[Bytes], i: usize) -> Result<String, String> {
    args.get(i)
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .ok_or_else(|| "ERR wrong number of arguments".to_string())
}

fn raw(args: &[Bytes], i: usize) -> Result<Bytes, String> {
    args.get(i)
        .cloned()
        .ok_or_else(|| "ERR wrong number of arguments".to_string())
}

fn int(args: &[Bytes], i: usize) -> Result<i64, String> {
    text(args, i)?
        .parse()
        .map_err(|_| "ERR value is not an integer or out of range".to_string())
}

fn float(args: &[Bytes], i: usize) -> Result<f64, String> {
    match text(args, i)?.as_str() {
        "-inf" => Ok(f64::NEG_INFINITY),
        "+inf" | "inf" => Ok(f64::INFINITY),
        s => s.parse().map_err(|_| "ERR value is not a valid float".to_string()),
    }
}

fn score(value: f64) -> Frame {
    if value.fract() == 0.0 && value.is_finite() {
        bulk(&(value as i64).to_string())
    } else {
        bulk(&value.to_string())
    }
}

fn glob(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => glob(&pattern[1..], text) || (!text.is_empty() && glob(pattern, &text[1..])),
        (Some(b'?'), Some(_)) => glob(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Inclusive index range with negative indices counted from the end.
fn span(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if len == 0 || start > stop {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn new_entry(value: Value) -> Entry {
    Entry {
        value,
        expires_at: None,
    }
}

macro_rules! typed_mut {
    ($state:expr, $key:expr, $variant:ident, $default:expr) => {
        match &mut $state
            .data
            .entry($key)
            .or_insert_with(|| new_entry(Value::$variant($default)))
            .value
        {
            Value::$variant(inner) => inner,
            _ => return Err(WRONGTYPE.to_string()),
        }
    };
}

macro_rules! typed_ref {
    ($state:expr, $key:expr, $variant:ident) => {
        match $state.data.get(&$key).map(|entry| &entry.value) {
            None => None,
            Some(Value::$variant(inner)) => Some(inner),
            Some(_) => return Err(WRONGTYPE.to_string()),
        }
    };
}

fn run(state: &mut State, name: &str, args: &[Bytes]) -> Reply {
    match name {
        "PING" => Ok(match args.first() {
            Some(data) => Frame::Bulk(data.clone()),
            None => Frame::Simple("PONG".to_string()),
        }),
        "SELECT" => Ok(ok()),
        "GET" => {
            let key = text(args, 0)?;
            Ok(match typed_ref!(state, key, Str) {
                Some(value) => Frame::Bulk(value.clone()),
                None => Frame::Null,
            })
        }
        "SET" => {
            let key = text(args, 0)?;
            let value = raw(args, 1)?;
            let mut nx = false;
            let mut ttl = None;
            let mut i = 2;
            while i < args.len() {
                match text(args, i)?.to_ascii_uppercase().as_str() {
                    "NX" => nx = true,
                    "EX" => {
                        ttl = Some(Duration::from_secs(int(args, i + 1)? as u64));
                        i += 1;
                    }
                    "PX" => {
                        ttl = Some(Duration::from_millis(int(args, i + 1)? as u64));
                        i += 1;
                    }
                    _ => return Err("ERR syntax error".to_string()),
                }
                i += 1;
            }
            if nx && state.data.contains_key(&key) {
                return Ok(Frame::Null);
            }
            state.data.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            Ok(ok())
        }
        "SETNX" => {
            let key = text(args, 0)?;
            if state.data.contains_key(&key) {
                return Ok(Frame::Integer(0));
            }
            state.data.insert(key, new_entry(Value::Str(raw(args, 1)?)));
            Ok(Frame::Integer(1))
        }
        "DEL" => {
            let mut removed = 0;
            for i in 0..args.len() {
                if state.data.remove(&text(args, i)?).is_some() {
                    removed += 1;
                }
            }
            Ok(Frame::Integer(removed))
        }
        "EXISTS" => {
            let mut found = 0;
            for i in 0..args.len() {
                if state.data.contains_key(&text(args, i)?) {
                    found += 1;
                }
            }
            Ok(Frame::Integer(found))
        }
        "INCR" | "INCRBY" => {
            let key = text(args, 0)?;
            let by = if name == "INCR" { 1 } else { int(args, 1)? };
            let value = typed_mut!(state, key, Str, Bytes::from_static(b"0"));
            let current: i64 = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| "ERR value is not an integer or out of range".to_string())?;
            *value = Bytes::from((current + by).to_string());
            Ok(Frame::Integer(current + by))
        }
        "EXPIRE" => {
            let key = text(args, 0)?;
            let secs = int(args, 1)?;
            let nx = args.len() > 2 && text(args, 2)?.eq_ignore_ascii_case("NX");
            Ok(match state.data.get_mut(&key) {
                None => Frame::Integer(0),
                Some(entry) if nx && entry.expires_at.is_some() => Frame::Integer(0),
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(secs.max(0) as u64));
                    Frame::Integer(1)
                }
            })
        }
        "TTL" => {
            let key = text(args, 0)?;
            Ok(Frame::Integer(match state.data.get(&key) {
                None => -2,
                Some(Entry {
                    expires_at: None, ..
                }) => -1,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => {
                    let left = at.saturating_duration_since(Instant::now()).as_millis();
                    ((left + 999) / 1000) as i64
                }
            }))
        }
        "KEYS" => {
            let pattern = raw(args, 0)?;
            let mut keys: Vec<&String> = state
                .data
                .keys()
                .filter(|k| glob(&pattern, k.as_bytes()))
                .collect();
            keys.sort();
            Ok(Frame::Array(keys.into_iter().map(|k| bulk(k)).collect()))
        }
        "SCAN" => {
            let cursor = int(args, 0)? as usize;
            let mut pattern = Bytes::from_static(b"*");
            let mut count = 10;
            let mut i = 1;
            while i + 1 < args.len() {
                match text(args, i)?.to_ascii_uppercase().as_str() {
                    "MATCH" => pattern = raw(args, i + 1)?,
                    "COUNT" => count = int(args, i + 1)? as usize,
                    _ => return Err("ERR syntax error".to_string()),
                }
                i += 2;
            }

            let mut keys: Vec<&String> = state.data.keys().collect();
            keys.sort();
            let start = cursor.min(keys.len());
            let end = (cursor + count.max(1)).min(keys.len());
            let page = keys[start..end]
                .iter()
                .filter(|k| glob(&pattern, k.as_bytes()))
                .map(|k| bulk(k))
                .collect();
            let next = if end >= keys.len() { 0 } else { end };
            Ok(Frame::Array(vec![bulk(&next.to_string()), Frame::Array(page)]))
        }
        "MGET" => {
            let mut values = Vec::new();
            for i in 0..args.len() {
                values.push(match state.data.get(&text(args, i)?).map(|e| &e.value) {
                    Some(Value::Str(v)) => Frame::Bulk(v.clone()),
                    _ => Frame::Null,
                });
            }
            Ok(Frame::Array(values))
        }
        "HSET" | "HMSET" => {
            let key = text(args, 0)?;
            if args.len() < 3 || args.len() % 2 == 0 {
                return Err("ERR wrong number of arguments".to_string());
            }
            let hash = typed_mut!(state, key, Hash, BTreeMap::new());
            let mut added = 0;
            for pair in args[1..].chunks(2) {
                let field = String::from_utf8_lossy(&pair[0]).into_owned();
                if hash.insert(field, pair[1].clone()).is_none() {
                    added += 1;
                }
            }
            Ok(if name == "HSET" { Frame::Integer(added) } else { ok() })
        }
        "HSETNX" => {
            let key = text(args, 0)?;
            let field = text(args, 1)?;
            let value = raw(args, 2)?;
            let hash = typed_mut!(state, key, Hash, BTreeMap::new());
            if hash.contains_key(&field) {
                return Ok(Frame::Integer(0));
            }
            hash.insert(field, value);
            Ok(Frame::Integer(1))
        }
        "HGETALL" | "HKEYS" => {
            let key = text(args, 0)?;
            let mut out = Vec::new();
            if let Some(hash) = typed_ref!(state, key, Hash) {
                for (field, value) in hash {
                    out.push(bulk(field));
                    if name == "HGETALL" {
                        out.push(Frame::Bulk(value.clone()));
                    }
                }
            }
            Ok(Frame::Array(out))
        }
        "HGET" => {
            let key = text(args, 0)?;
            let field = text(args, 1)?;
            Ok(typed_ref!(state, key, Hash)
                .and_then(|hash| hash.get(&field))
                .map_or(Frame::Null, |v| Frame::Bulk(v.clone())))
        }
        "HINCRBY" => {
            let key = text(args, 0)?;
            let field = text(args, 1)?;
            let by = int(args, 2)?;
            let hash = typed_mut!(state, key, Hash, BTreeMap::new());
            let current: i64 = match hash.get(&field) {
                Some(v) => std::str::from_utf8(v)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| "ERR hash value is not an integer".to_string())?,
                None => 0,
            };
            hash.insert(field, Bytes::from((current + by).to_string()));
            Ok(Frame::Integer(current + by))
        }
        "SADD" => {
            let key = text(args, 0)?;
            let set = typed_mut!(state, key, Set, BTreeSet::new());
            let added = args[1..].iter().filter(|m| set.insert((*m).clone())).count();
            Ok(Frame::Integer(added as i64))
        }
        "ZADD" => {
            let key = text(args, 0)?;
            let nx = text(args, 1)?.eq_ignore_ascii_case("NX");
            let first = if nx { 2 } else { 1 };
            let mut pairs = Vec::new();
            let mut i = first;
            while i < args.len() {
                pairs.push((float(args, i)?, text(args, i + 1)?));
                i += 2;
            }
            let zset = typed_mut!(state, key, ZSet, BTreeMap::new());
            let mut added = 0;
            for (score, member) in pairs {
                if !zset.contains_key(&member) {
                    added += 1;
                    zset.insert(member, score);
                } else if !nx {
                    zset.insert(member, score);
                }
            }
            Ok(Frame::Integer(added))
        }
        "ZRANGE" => {
            let key = text(args, 0)?;
            let (start, stop) = (int(args, 1)?, int(args, 2)?);
            let members = sorted_members(typed_ref!(state, key, ZSet));
            Ok(Frame::Array(match span(members.len(), start, stop) {
                Some((a, b)) => members[a..=b].iter().map(|(m, _)| bulk(m)).collect(),
                None => Vec::new(),
            }))
        }
        "ZSCORE" => {
            let key = text(args, 0)?;
            let member = text(args, 1)?;
            Ok(typed_ref!(state, key, ZSet)
                .and_then(|z| z.get(&member))
                .map_or(Frame::Null, |s| score(*s)))
        }
        "ZMSCORE" => {
            let key = text(args, 0)?;
            let zset = typed_ref!(state, key, ZSet);
            let mut out = Vec::new();
            for i in 1..args.len() {
                let member = text(args, i)?;
                out.push(
                    zset.and_then(|z| z.get(&member))
                        .map_or(Frame::Null, |s| score(*s)),
                );
            }
            Ok(Frame::Array(out))
        }
        "ZCARD" => {
            let key = text(args, 0)?;
            Ok(Frame::Integer(
                typed_ref!(state, key, ZSet).map_or(0, |z| z.len() as i64),
            ))
        }
        "ZREM" => {
            let key = text(args, 0)?;
            let members: Vec<String> = (1..args.len()).map(|i| text(args, i)).collect::<Result<_, _>>()?;
            let zset = typed_mut!(state, key, ZSet, BTreeMap::new());
            let removed = members.iter().filter(|m| zset.remove(*m).is_some()).count();
            Ok(Frame::Integer(removed as i64))
        }
        "ZCOUNT" => {
            let key = text(args, 0)?;
            let (min, max) = (float(args, 1)?, float(args, 2)?);
            Ok(Frame::Integer(typed_ref!(state, key, ZSet).map_or(0, |z| {
                z.values().filter(|s| **s >= min && **s <= max).count() as i64
            })))
        }
        "ZRANDMEMBER" => {
            let key = text(args, 0)?;
            let count = int(args, 1)?.max(0) as usize;
            let members = sorted_members(typed_ref!(state, key, ZSet));
            Ok(Frame::Array(
                members.iter().take(count).map(|(m, _)| bulk(m)).collect(),
            ))
        }
        "RPUSH" => {
            let key = text(args, 0)?;
            let list = typed_mut!(state, key, List, VecDeque::new());
            list.extend(args[1..].iter().cloned());
            Ok(Frame::Integer(list.len() as i64))
        }
        "LRANGE" => {
            let key = text(args, 0)?;
            let (start, stop) = (int(args, 1)?, int(args, 2)?);
            Ok(Frame::Array(match typed_ref!(state, key, List) {
                Some(list) => match span(list.len(), start, stop) {
                    Some((a, b)) => list.range(a..=b).cloned().map(Frame::Bulk).collect(),
                    None => Vec::new(),
                },
                None => Vec::new(),
            }))
        }
        "LINDEX" => {
            let key = text(args, 0)?;
            let index = int(args, 1)?;
            Ok(match typed_ref!(state, key, List) {
                Some(list) => match span(list.len(), index, index) {
                    Some((a, _)) => Frame::Bulk(list[a].clone()),
                    None => Frame::Null,
                },
                None => Frame::Null,
            })
        }
        "SCRIPT" => {
            if !text(args, 0)?.eq_ignore_ascii_case("LOAD") {
                return Err("ERR unknown SCRIPT subcommand".to_string());
            }
            let src = text(args, 1)?;
            let sha = sha1_hex(&src);
            state.scripts.insert(sha.clone(), src);
            Ok(bulk(&sha))
        }
        "EVAL" => {
            let src = text(args, 0)?;
            state.scripts.insert(sha1_hex(&src), src.clone());
            eval(state, &src, &args[1..])
        }
        "EVALSHA" => {
            let sha = text(args, 0)?.to_ascii_lowercase();
            let Some(src) = state.scripts.get(&sha).cloned() else {
                return Err("NOSCRIPT No matching script. Please use EVAL.".to_string());
            };
            eval(state, &src, &args[1..])
        }
        "PUBLISH" => {
            let channel = text(args, 0)?;
            let message = raw(args, 1)?;
            let push = Frame::Array(vec![bulk("message"), bulk(&channel), Frame::Bulk(message)]);
            let delivered = state.subscribers.get(&channel).map_or(0, |subscribers| {
                subscribers
                    .iter()
                    .filter(|(_, tx)| tx.send(push.clone()).is_ok())
                    .count()
            });
            Ok(Frame::Integer(delivered as i64))
        }
        "MEMORY" => {
            if !text(args, 0)?.eq_ignore_ascii_case("STATS") {
                return Err("ERR unknown MEMORY subcommand".to_string());
            }
            Ok(Frame::Array(vec![
                bulk("peak.allocated"),
                Frame::Integer(1_048_576),
                bulk("keys.count"),
                Frame::Integer(state.data.len() as i64),
                bulk("dataset.percentage"),
                bulk("12.5"),
            ]))
        }
        other => Err(format!("ERR unknown command '{}'", other)),
    }
}

fn sorted_members(zset: Option<&BTreeMap<String, f64>>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = zset
        .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
        .unwrap_or_default();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

fn eval(state: &mut State, src: &str, rest: &[Bytes]) -> Reply {
    let numkeys = int(rest, 0)? as usize;
    let keys: Vec<String> = (1..=numkeys).map(|i| text(rest, i)).collect::<Result<_, _>>()?;
    let argv = &rest[(numkeys + 1).min(rest.len())..];

    if src.contains(LOCK_RELEASE_MARKER) {
        let key = keys.first().cloned().ok_or("ERR missing key")?;
        let token = raw(argv, 0)?;
        let held = matches!(
            state.data.get(&key).map(|e| &e.value),
            Some(Value::Str(v)) if *v == token
        );
        if held {
            state.data.remove(&key);
            return Ok(Frame::Integer(1));
        }
        return Ok(Frame::Integer(0));
    }

    if src == LIST_OR_MISSING {
        let key = keys.first().cloned().ok_or("ERR missing key")?;
        if !state.data.contains_key(&key) {
            return Ok(Frame::Integer(-1));
        }
        let lrange = [Bytes::from(key), Bytes::from_static(b"0"), Bytes::from_static(b"-1")];
        return run(state, "LRANGE", &lrange);
    }

    if src == RETURN_SEVEN {
        return Ok(Frame::Integer(7));
    }

    Err("ERR unsupported script".to_string())
}
