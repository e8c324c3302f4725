//! Commands sent to the store.
//!
//! A [`Command`] is an immutable name plus argument list. It is the unit that
//! is written on the wire, whether standalone, pipelined, or queued inside a
//! [`TransactionBatch`](crate::TransactionBatch).

mod args;
pub use args::{Args, ToArg};

use crate::frame::PushFrame;
use crate::Frame;
use bytes::Bytes;

/// Conversion of a request into the frame written on the socket.
pub trait Protocol {
    fn into_frame(self) -> Frame;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    name: String,
    args: Args,
}

impl Command {
    pub fn new(name: impl ToString) -> Command {
        Command {
            name: name.to_string(),
            args: Args::new(),
        }
    }

    pub fn with_args(name: impl ToString, args: Args) -> Command {
        Command {
            name: name.to_string(),
            args,
        }
    }

    #[must_use]
    pub fn arg<T: ToArg>(mut self, value: T) -> Command {
        self.args.push(value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// `INCR key`
    pub fn incr(key: &str) -> Command {
        Command::new("INCR").arg(key)
    }

    /// `EXPIRE key seconds`
    pub fn expire(key: &str, seconds: i64) -> Command {
        Command::new("EXPIRE").arg(key).arg(seconds)
    }

    /// `HSET key field value [field value ...]`
    pub fn hset<I, F, V>(key: &str, fields: I) -> Command
    where
        I: IntoIterator<Item = (F, V)>,
        F: ToArg,
        V: ToArg,
    {
        Command::with_args("HSET", flatten_pairs(Args::new().add(key), fields))
    }

    /// `HMSET key field value [field value ...]`
    pub fn hmset<I, F, V>(key: &str, fields: I) -> Command
    where
        I: IntoIterator<Item = (F, V)>,
        F: ToArg,
        V: ToArg,
    {
        Command::with_args("HMSET", flatten_pairs(Args::new().add(key), fields))
    }

    /// `HINCRBY key field increment`
    pub fn hincrby(key: &str, field: &str, increment: i64) -> Command {
        Command::new("HINCRBY").arg(key).arg(field).arg(increment)
    }

    /// `HGET key field`
    pub fn hget(key: &str, field: &str) -> Command {
        Command::new("HGET").arg(key).arg(field)
    }
}

pub(crate) fn flatten_pairs<I, F, V>(mut args: Args, pairs: I) -> Args
where
    I: IntoIterator<Item = (F, V)>,
    F: ToArg,
    V: ToArg,
{
    for (field, value) in pairs {
        args.push(field);
        args.push(value);
    }
    args
}

impl Protocol for &Command {
    fn into_frame(self) -> Frame {
        let mut frame = Vec::with_capacity(self.args.len() + 1);
        frame.push_bulk(Bytes::from(self.name.clone().into_bytes()));
        for arg in &self.args {
            frame.push_bulk(arg.clone());
        }

        frame.into()
    }
}
