//! A RESP2 frame as exchanged with the store, together with the two-phase
//! `check` / `parse` decoder used by the transport.

use bytes::{Buf, Bytes};
use std::fmt;
use std::io::Cursor;
use std::num::TryFromIntError;
use std::string::FromUtf8Error;

/// A frame in the Redis serialization protocol.
///
/// Integers are signed: the store uses negative replies (`TTL` returns -1 / -2,
/// scripts may return -1). Both the null bulk string and the null array decode
/// as `Frame::Null`.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

#[derive(Debug)]
pub enum FrameError {
    /// Not enough data is available to parse a message
    Incomplete,

    /// Invalid message encoding
    Invalid(String),
}

/// Builds an array frame entry by entry.
pub trait PushFrame {
    fn push_bulk(&mut self, bytes: Bytes);
}

impl PushFrame for Vec<Frame> {
    fn push_bulk(&mut self, bytes: Bytes) {
        self.push(Frame::Bulk(bytes));
    }
}

impl Frame {
    /// Checks if an entire message can be decoded from `src`
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), FrameError> {
        match get_u8(src)? {
            b'+' | b'-' => {
                get_line(src)?;
                Ok(())
            }
            b':' => {
                let _ = get_decimal(src)?;
                Ok(())
            }
            b'$' => {
                let len = get_decimal(src)?;
                if len < 0 {
                    // `$-1\r\n`
                    return Ok(());
                }
                // Skip the payload and the trailing `\r\n`.
                skip(src, usize::try_from(len)? + 2)
            }
            b'*' => {
                let len = get_decimal(src)?;
                for _ in 0..len.max(0) {
                    Frame::check(src)?;
                }
                Ok(())
            }
            actual => Err(FrameError::Invalid(format!(
                "protocol error; invalid frame type byte `{}`",
                actual
            ))),
        }
    }

    /// The message has already been validated with `check`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, FrameError> {
        match get_u8(src)? {
            b'+' => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Simple(String::from_utf8(line)?))
            }
            b'-' => {
                let line = get_line(src)?.to_vec();
                Ok(Frame::Error(String::from_utf8(line)?))
            }
            b':' => Ok(Frame::Integer(get_decimal(src)?)),
            b'$' => {
                let len = get_decimal(src)?;
                if len < 0 {
                    return Ok(Frame::Null);
                }

                let len = usize::try_from(len)?;
                let n = len + 2;
                if src.remaining() < n {
                    return Err(FrameError::Incomplete);
                }

                let data = Bytes::copy_from_slice(&src.chunk()[..len]);
                if &src.chunk()[len..n] != b"\r\n" {
                    return Err("protocol error; bulk string not terminated by CRLF".into());
                }
                skip(src, n)?;

                Ok(Frame::Bulk(data))
            }
            b'*' => {
                let len = get_decimal(src)?;
                if len < 0 {
                    return Ok(Frame::Null);
                }

                let len = usize::try_from(len)?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..len {
                    out.push(Frame::parse(src)?);
                }

                Ok(Frame::Array(out))
            }
            actual => Err(FrameError::Invalid(format!(
                "protocol error; invalid frame type byte `{}`",
                actual
            ))),
        }
    }

    /// Converts the frame to an "unexpected frame" error
    pub(crate) fn to_error(&self) -> crate::Error {
        match self {
            Frame::Error(msg) => crate::Error::Server(msg.clone()),
            other => crate::Error::Protocol(format!("unexpected frame: {}", other)),
        }
    }
}

impl From<Vec<Frame>> for Frame {
    fn from(frames: Vec<Frame>) -> Frame {
        Frame::Array(frames)
    }
}

impl PartialEq<&str> for Frame {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Frame::Simple(s) => s.eq(other),
            Frame::Bulk(s) => s.eq(other),
            _ => false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::str;

        match self {
            Frame::Simple(response) => response.fmt(fmt),
            Frame::Error(msg) => write!(fmt, "error: {}", msg),
            Frame::Integer(num) => num.fmt(fmt),
            Frame::Bulk(msg) => match str::from_utf8(msg) {
                Ok(string) => string.fmt(fmt),
                Err(_) => write!(fmt, "{:?}", msg),
            },
            Frame::Null => "(nil)".fmt(fmt),
            Frame::Array(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(fmt, " ")?;
                    }
                    part.fmt(fmt)?;
                }

                Ok(())
            }
        }
    }
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, FrameError> {
    if !src.has_remaining() {
        return Err(FrameError::Incomplete);
    }

    Ok(src.get_u8())
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), FrameError> {
    if src.remaining() < n {
        return Err(FrameError::Incomplete);
    }

    src.advance(n);
    Ok(())
}

/// Read a signed decimal terminated by `\r\n`.
fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, FrameError> {
    use atoi::atoi;

    let line = get_line(src)?;

    atoi::<i64>(line).ok_or_else(|| "protocol error; invalid frame format".into())
}

/// Find a line
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], FrameError> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();
    let end = buf.len().saturating_sub(1);

    for i in start..end {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            src.set_position((i + 2) as u64);
            return Ok(&buf[start..i]);
        }
    }

    Err(FrameError::Incomplete)
}

impl From<String> for FrameError {
    fn from(src: String) -> FrameError {
        FrameError::Invalid(src)
    }
}

impl From<&str> for FrameError {
    fn from(src: &str) -> FrameError {
        src.to_string().into()
    }
}

impl From<FromUtf8Error> for FrameError {
    fn from(_src: FromUtf8Error) -> FrameError {
        "protocol error; invalid frame format".into()
    }
}

impl From<TryFromIntError> for FrameError {
    fn from(_src: TryFromIntError) -> FrameError {
        "protocol error; invalid frame format".into()
    }
}

impl From<FrameError> for crate::Error {
    fn from(src: FrameError) -> crate::Error {
        match src {
            FrameError::Incomplete => crate::Error::Protocol("incomplete frame".to_string()),
            FrameError::Invalid(msg) => crate::Error::Protocol(msg),
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Incomplete => "stream ended early".fmt(fmt),
            FrameError::Invalid(err) => err.fmt(fmt),
        }
    }
}

impl std::error::Error for FrameError {}
