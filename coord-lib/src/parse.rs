//!
//! Cursor over an array reply
//!

use crate::Frame;

use bytes::Bytes;
use std::{fmt, str, vec};

/// Multi-element replies (`SCAN`, `HGETALL`, `MEMORY STATS`, pub/sub pushes)
/// arrive as array frames. A `Parse` is initialized with the array frame and
/// provides a cursor-like API over its entries.
#[derive(Debug)]
pub(crate) struct Parse {
    frames: vec::IntoIter<Frame>,
}

#[derive(Debug)]
pub(crate) enum ParseError {
    /// Attempting to extract a value failed due to the frame being fully consumed.
    EndOfStream,

    /// The entry had an unexpected shape.
    Other(crate::Error),
}

impl Parse {
    /// Returns `Err` if `frame` is not an array frame.
    pub(crate) fn new(frame: Frame) -> Result<Parse, ParseError> {
        let array = match frame {
            Frame::Array(array) => array,
            Frame::Error(msg) => return Err(ParseError::Other(crate::Error::Server(msg))),
            Frame::Null => return Err(ParseError::Other(crate::Error::Nil)),
            other => return Err(format!("protocol error; expected array, got {:?}", other).into()),
        };

        Ok(Parse {
            frames: array.into_iter(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn next(&mut self) -> Result<Frame, ParseError> {
        self.frames.next().ok_or(ParseError::EndOfStream)
    }

    /// Return the next entry as a string. A nil entry reads as `""`.
    pub(crate) fn next_string(&mut self) -> Result<String, ParseError> {
        match self.next()? {
            // Both `Simple` and `Bulk` representation may be strings.
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(data) => str::from_utf8(&data[..])
                .map(|s| s.to_string())
                .map_err(|_| "protocol error; invalid string".into()),
            Frame::Null => Ok(String::new()),
            other => Err(format!(
                "protocol error; expected simple frame or bulk frame, got {:?}",
                other
            )
            .into()),
        }
    }

    /// Return the next entry as raw bytes.
    pub(crate) fn next_bytes(&mut self) -> Result<Bytes, ParseError> {
        match self.next()? {
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            frame => Err(format!(
                "protocol error; expected simple frame or bulk frame, got {:?}",
                frame
            )
            .into()),
        }
    }

    /// Return the next entry as an integer.
    ///
    /// This includes `Simple`, `Bulk`, and `Integer` frame types. `Simple` and
    /// `Bulk` frame types are parsed.
    pub(crate) fn next_int(&mut self) -> Result<i64, ParseError> {
        use atoi::atoi;

        const MSG: &str = "protocol error; invalid number";

        match self.next()? {
            Frame::Integer(v) => Ok(v),
            Frame::Simple(data) => atoi::<i64>(data.as_bytes()).ok_or_else(|| MSG.into()),
            Frame::Bulk(data) => atoi::<i64>(&data).ok_or_else(|| MSG.into()),
            frame => Err(format!("protocol error; expected int frame but got {:?}", frame).into()),
        }
    }

    /// Ensure there are no more entries in the array
    pub(crate) fn finish(&mut self) -> Result<(), ParseError> {
        if self.frames.next().is_none() {
            Ok(())
        } else {
            Err("protocol error; expected end of frame, but there was more".into())
        }
    }
}

impl From<String> for ParseError {
    fn from(src: String) -> ParseError {
        ParseError::Other(crate::Error::Protocol(src))
    }
}

impl From<&str> for ParseError {
    fn from(src: &str) -> ParseError {
        src.to_string().into()
    }
}

impl From<ParseError> for crate::Error {
    fn from(src: ParseError) -> crate::Error {
        match src {
            ParseError::EndOfStream => {
                crate::Error::Protocol("unexpected end of array reply".to_string())
            }
            ParseError::Other(err) => err,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::EndOfStream => "protocol error; unexpected end of stream".fmt(f),
            ParseError::Other(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for ParseError {}
