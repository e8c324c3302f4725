use crate::cmd::Command;
use crate::{Frame, Result};
use std::future::Future;

/// The request capability shared by pooled connections and anything else
/// that can talk to the store.
///
/// Locks, scripts and transaction batches are written against this trait so
/// they work with any connection type.
pub trait Conn: Send {
    /// Buffer `cmd` on the output stream without waiting for its reply.
    fn send(&mut self, cmd: &Command) -> impl Future<Output = Result<()>> + Send;

    /// Write buffered commands to the socket.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Read the next outstanding reply. An error reply is returned as
    /// `Error::Server`.
    fn receive(&mut self) -> impl Future<Output = Result<Frame>> + Send;

    /// Flush and read every outstanding reply to earlier sends. The first
    /// error reply among them, if any, is returned once all are consumed.
    fn drain(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Send `cmd`, flush, and return its reply. Replies to commands sent
    /// earlier with [`Conn::send`] are read first; the first error reply
    /// among them, if any, is returned instead.
    fn do_command(&mut self, cmd: &Command) -> impl Future<Output = Result<Frame>> + Send;
}
