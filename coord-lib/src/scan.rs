use crate::cmd::Command;
use crate::parse::Parse;
use crate::shutdown::Shutdown;
use crate::{Conn, Connection, Error, Frame, Result};
use async_stream::try_stream;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;

/// Keys produced by a background `SCAN` loop.
///
/// Both channels are closed exactly once, when the loop exits: after the
/// store reports the terminal cursor, after the first error (delivered on
/// the error channel), or when the shutdown signal fires. Once the signal
/// has fired no further keys are handed out, even ones already buffered.
/// Dropping the stream stops the loop.
#[derive(Debug)]
pub struct ScanStream {
    keys: mpsc::Receiver<String>,
    errors: mpsc::Receiver<Error>,
    shutdown: Shutdown,
}

impl ScanStream {
    /// The next matching key, or `None` once the scan has ended.
    pub async fn recv_key(&mut self) -> Option<String> {
        if self.shutdown.is_shutdown() {
            return None;
        }

        tokio::select! {
            biased;
            () = self.shutdown.recv() => None,
            key = self.keys.recv() => key,
        }
    }

    /// The error that ended the scan, if any. Resolves once the key channel
    /// has closed.
    pub async fn recv_error(&mut self) -> Option<Error> {
        if self.shutdown.is_shutdown() {
            return None;
        }

        tokio::select! {
            biased;
            () = self.shutdown.recv() => None,
            err = self.errors.recv() => err,
        }
    }

    /// Adapt into a single stream of keys ending with the error, if any.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<String>> {
        try_stream! {
            while let Some(key) = self.recv_key().await {
                yield key;
            }

            if let Some(err) = self.recv_error().await {
                Err::<(), Error>(err)?;
            }
        }
    }

    /// Drain every key, failing on the loop's error.
    pub async fn collect(mut self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        while let Some(key) = self.recv_key().await {
            keys.push(key);
        }

        match self.recv_error().await {
            Some(err) => Err(err),
            None => Ok(keys),
        }
    }
}

pub(crate) fn spawn(conn: Connection, pattern: String, count: usize, shutdown: Shutdown) -> ScanStream {
    let (key_tx, keys) = mpsc::channel(1);
    let (err_tx, errors) = mpsc::channel(1);
    let task_shutdown = shutdown.clone();

    tokio::spawn(async move {
        if let Err(err) = run(conn, &pattern, count, task_shutdown.clone(), &key_tx).await {
            let mut shutdown = task_shutdown;
            tokio::select! {
                _ = err_tx.send(err) => {}
                () = shutdown.recv() => {}
            }
        }
        debug!(%pattern, "scan finished");
        // Dropping the senders closes both channels.
    });

    ScanStream {
        keys,
        errors,
        shutdown,
    }
}

async fn run(
    mut conn: Connection,
    pattern: &str,
    count: usize,
    mut shutdown: Shutdown,
    keys: &mpsc::Sender<String>,
) -> Result<()> {
    let mut cursor = "0".to_string();

    loop {
        if shutdown.is_shutdown() {
            return Ok(());
        }

        let cmd = Command::new("SCAN")
            .arg(&cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);

        // A request abandoned midway leaves the connection marked broken, so
        // it is closed rather than returned to the pool.
        let reply = tokio::select! {
            biased;
            () = shutdown.recv() => return Ok(()),
            reply = conn.do_command(&cmd) => reply?,
        };
        let (next, page) = decode_page(reply)?;

        for key in page {
            tokio::select! {
                biased;
                () = shutdown.recv() => return Ok(()),
                sent = keys.send(key) => {
                    if sent.is_err() {
                        // The stream was dropped.
                        return Ok(());
                    }
                }
            }
        }

        if next == "0" {
            return Ok(());
        }
        cursor = next;
    }
}

/// A scan reply is `[cursor, [key, ...]]`.
fn decode_page(reply: Frame) -> Result<(String, Vec<String>)> {
    let mut parse = Parse::new(reply)?;
    if parse.len() != 2 {
        return Err(Error::Protocol(format!(
            "expected a 2 element scan reply, got {}",
            parse.len()
        )));
    }

    let cursor = parse.next_string()?;
    let keys = match parse.next()? {
        Frame::Array(entries) => {
            let mut keys = Vec::with_capacity(entries.len());
            let mut entries = Parse::new(Frame::Array(entries))?;
            for _ in 0..entries.len() {
                keys.push(entries.next_string()?);
            }
            keys
        }
        frame => return Err(Error::Protocol(format!("unexpected scan page {}", frame))),
    };

    Ok((cursor, keys))
}
