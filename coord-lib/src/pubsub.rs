//! Publish/subscribe over a dedicated connection.
//!
//! A subscription runs two activities over one connection. A spawned receive
//! task reads server pushes and dispatches them to the [`PubSubHandler`]. The
//! caller's task runs the control loop: it sends a liveness `PING` every
//! ping period and watches the shutdown signal. The connection's read
//! timeout exceeds the ping period, so a missing pong ends the receive task
//! with a timeout error, which the control loop returns.
//!
//! On shutdown the control loop unsubscribes from every channel and waits
//! for the receive task to observe the zero-subscription confirmation before
//! returning.

use crate::cmd::{Args, Command, ToArg};
use crate::parse::Parse;
use crate::shutdown::Shutdown;
use crate::transport::{FrameReader, FrameWriter, Transport};
use crate::{Connection, Error, Frame, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Callbacks invoked by the receive task. They run on that task, so they
/// should return quickly.
pub trait PubSubHandler: Send + Sync + 'static {
    /// Called once, when the store has confirmed every requested channel.
    /// An error ends the subscription with `Error::Callback`.
    fn on_subscribed(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn on_message(&self, channel: &str, payload: Bytes);

    /// Called with the payload of each liveness pong.
    fn on_health_check(&self, _data: &str) {}
}

/// A server push on a subscribed connection.
#[derive(Debug, PartialEq)]
enum Event {
    Message { channel: String, payload: Bytes },
    Subscription { kind: String, channel: String, count: i64 },
    Pong(String),
}

pub(crate) async fn listen<H: PubSubHandler>(
    transport: Transport,
    ping_period: Duration,
    handler: H,
    mut shutdown: Shutdown,
    channels: &[String],
) -> Result<()> {
    let channels = dedup(channels);
    if channels.is_empty() {
        return Err(Error::Config("no channels to subscribe to".to_string()));
    }

    let (mut reader, mut writer) = transport.into_split();
    writer
        .send(&Command::with_args("SUBSCRIBE", Args::new().add_flat(&channels)))
        .await?;

    let (done_tx, mut done) = oneshot::channel();
    let handler = Arc::new(handler);
    let expected = channels.len();
    let _receiver = AbortOnDrop(tokio::spawn(async move {
        let res = receive(&mut reader, handler.as_ref(), expected).await;
        let _ = done_tx.send(res);
    }));

    let mut ticker = time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ping(&mut writer).await?;
            }
            () = shutdown.recv() => break,
            res = &mut done => return finished(res),
        }
    }

    debug!("unsubscribing");
    writer.send(&Command::new("UNSUBSCRIBE")).await?;

    let res = finished(done.await);
    info!("subscription drained");
    res
}

/// Stops the receive task when `listen` returns or its future is dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn ping(writer: &mut FrameWriter) -> Result<()> {
    writer.send(&Command::new("PING").arg("")).await
}

fn finished(res: std::result::Result<Result<()>, oneshot::error::RecvError>) -> Result<()> {
    res.map_err(|_| Error::Protocol("subscription receiver exited unexpectedly".to_string()))?
}

/// Dispatch pushes until the store confirms zero subscribed channels or the
/// stream fails.
async fn receive<H: PubSubHandler + ?Sized>(reader: &mut FrameReader, handler: &H, expected: usize) -> Result<()> {
    let mut subscribed = false;

    loop {
        let frame = reader.read_reply().await?;

        match classify(frame)? {
            Event::Message { channel, payload } => handler.on_message(&channel, payload),
            Event::Pong(data) => handler.on_health_check(&data),
            Event::Subscription {
                kind,
                channel,
                count,
            } => {
                debug!(%kind, %channel, count, "subscription changed");

                if kind == "subscribe" && !subscribed && count == expected as i64 {
                    subscribed = true;
                    handler.on_subscribed().map_err(Error::Callback)?;
                }
                if count == 0 {
                    return Ok(());
                }
            }
        }
    }
}

fn classify(frame: Frame) -> Result<Event> {
    // Outside of subscribed mode the store answers PING with `+PONG`.
    if let Frame::Simple(ref s) = frame {
        if s.eq_ignore_ascii_case("pong") {
            return Ok(Event::Pong(String::new()));
        }
    }

    let mut parse = Parse::new(frame)?;
    let kind = parse.next_string()?;

    let event = match kind.as_str() {
        "message" => Event::Message {
            channel: parse.next_string()?,
            payload: parse.next_bytes()?,
        },
        "subscribe" | "unsubscribe" => Event::Subscription {
            channel: parse.next_string()?,
            count: parse.next_int()?,
            kind,
        },
        "pong" => Event::Pong(parse.next_string()?),
        other => {
            warn!(kind = other, "unexpected push on subscribed connection");
            return Err(Error::Protocol(format!("unexpected pub/sub push `{}`", other)));
        }
    };

    parse.finish()?;
    Ok(event)
}

/// Drop repeated channel names, keeping the first occurrence.
fn dedup(channels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(channels.len());
    for channel in channels {
        if !out.contains(channel) {
            out.push(channel.clone());
        }
    }
    out
}

/// Publishes over a pooled connection.
pub struct Publisher {
    conn: Connection,
}

impl Publisher {
    pub(crate) fn new(conn: Connection) -> Publisher {
        Publisher { conn }
    }

    /// Returns the number of subscribers that received the message.
    pub async fn publish<M: ToArg>(&mut self, channel: &str, message: M) -> Result<i64> {
        self.conn.publish(channel, message).await
    }

    /// Close the connection instead of returning it to the pool.
    pub fn close(self) {
        self.conn.close();
    }
}
