use crate::cmd::Command;
use crate::reply::FromReply;
use crate::{Conn, Frame, Result};
use tracing::instrument;

/// An ordered list of commands executed as one `MULTI` / `EXEC` transaction.
#[derive(Clone, Debug, Default)]
pub struct TransactionBatch {
    commands: Vec<Command>,
}

impl TransactionBatch {
    pub fn new() -> TransactionBatch {
        TransactionBatch::default()
    }

    #[must_use]
    pub fn add(mut self, cmd: Command) -> TransactionBatch {
        self.commands.push(cmd);
        self
    }

    pub fn push(&mut self, cmd: Command) {
        self.commands.push(cmd);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Send `MULTI` and every queued command, then `EXEC`, returning the
    /// per-command results in submission order.
    ///
    /// If any send fails the `EXEC` is never issued and the store discards
    /// the queued commands. A command rejected while queueing fails the whole
    /// batch with that error. Errors raised while executing an individual
    /// command are returned as `Frame::Error` entries for the caller to
    /// interpret.
    #[instrument(skip_all, fields(commands = self.commands.len()))]
    pub async fn exec<C: Conn>(&self, conn: &mut C) -> Result<Vec<Frame>> {
        conn.send(&Command::new("MULTI")).await?;
        for cmd in &self.commands {
            conn.send(cmd).await?;
        }

        let reply = conn.do_command(&Command::new("EXEC")).await?;
        Vec::<Frame>::from_reply(reply)
    }
}
