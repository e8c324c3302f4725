//! Conversions from reply frames into native values.
//!
//! A nil reply converts to `Error::Nil`; callers that want a zero value on a
//! missing key map that error themselves. Error replies become
//! `Error::Server`.

use crate::parse::Parse;
use crate::{Error, Frame, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::str;

pub trait FromReply: Sized {
    fn from_reply(frame: Frame) -> Result<Self>;
}

impl FromReply for Frame {
    fn from_reply(frame: Frame) -> Result<Frame> {
        match frame {
            Frame::Error(msg) => Err(Error::Server(msg)),
            frame => Ok(frame),
        }
    }
}

impl FromReply for i64 {
    fn from_reply(frame: Frame) -> Result<i64> {
        match frame {
            Frame::Integer(v) => Ok(v),
            Frame::Bulk(data) => parse_number(&data),
            Frame::Simple(data) => parse_number(data.as_bytes()),
            Frame::Null => Err(Error::Nil),
            other => Err(other.to_error()),
        }
    }
}

impl FromReply for f64 {
    fn from_reply(frame: Frame) -> Result<f64> {
        match frame {
            #[allow(clippy::cast_precision_loss)]
            Frame::Integer(v) => Ok(v as f64),
            Frame::Bulk(data) => parse_float(&data),
            Frame::Simple(data) => parse_float(data.as_bytes()),
            Frame::Null => Err(Error::Nil),
            other => Err(other.to_error()),
        }
    }
}

impl FromReply for bool {
    fn from_reply(frame: Frame) -> Result<bool> {
        match frame {
            Frame::Integer(v) => Ok(v != 0),
            Frame::Simple(s) if s == "OK" => Ok(true),
            Frame::Null => Err(Error::Nil),
            other => Err(other.to_error()),
        }
    }
}

impl FromReply for String {
    fn from_reply(frame: Frame) -> Result<String> {
        match frame {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(data) => str::from_utf8(&data)
                .map(ToString::to_string)
                .map_err(|_| Error::Protocol("invalid utf-8 string reply".to_string())),
            Frame::Integer(v) => Ok(v.to_string()),
            Frame::Null => Err(Error::Nil),
            other => Err(other.to_error()),
        }
    }
}

impl FromReply for Bytes {
    fn from_reply(frame: Frame) -> Result<Bytes> {
        match frame {
            Frame::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            Frame::Bulk(data) => Ok(data),
            Frame::Null => Err(Error::Nil),
            other => Err(other.to_error()),
        }
    }
}

impl<T: FromReply> FromReply for Option<T> {
    fn from_reply(frame: Frame) -> Result<Option<T>> {
        match frame {
            Frame::Null => Ok(None),
            frame => T::from_reply(frame).map(Some),
        }
    }
}

impl FromReply for Vec<Frame> {
    fn from_reply(frame: Frame) -> Result<Vec<Frame>> {
        match frame {
            Frame::Array(values) => Ok(values),
            Frame::Null => Err(Error::Nil),
            other => Err(other.to_error()),
        }
    }
}

/// Nil entries become empty strings.
impl FromReply for Vec<String> {
    fn from_reply(frame: Frame) -> Result<Vec<String>> {
        let mut parse = Parse::new(frame)?;
        let mut out = Vec::with_capacity(parse.len());
        for _ in 0..parse.len() {
            out.push(parse.next_string()?);
        }
        Ok(out)
    }
}

/// Nil entries become zero.
impl FromReply for Vec<i64> {
    fn from_reply(frame: Frame) -> Result<Vec<i64>> {
        Vec::<Frame>::from_reply(frame)?
            .into_iter()
            .map(|frame| match frame {
                Frame::Null => Ok(0),
                frame => i64::from_reply(frame),
            })
            .collect()
    }
}

/// Decodes a flat `[field, value, field, value, ...]` reply.
impl<V: FromReply> FromReply for HashMap<String, V> {
    fn from_reply(frame: Frame) -> Result<HashMap<String, V>> {
        let values = Vec::<Frame>::from_reply(frame)?;
        if values.len() % 2 != 0 {
            return Err(Error::Protocol(
                "expected an even number of values for a map reply".to_string(),
            ));
        }

        let mut out = HashMap::with_capacity(values.len() / 2);
        let mut iter = values.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            out.insert(String::from_reply(field)?, V::from_reply(value)?);
        }
        Ok(out)
    }
}

/// Scores are integral in practice; a fractional score is truncated.
fn parse_number(data: &[u8]) -> Result<i64> {
    if let Some(v) = str::from_utf8(data).ok().and_then(|s| s.parse::<i64>().ok()) {
        return Ok(v);
    }

    let score = parse_float(data)?;
    #[allow(clippy::cast_possible_truncation)]
    let truncated = score as i64;
    Ok(truncated)
}

fn parse_float(data: &[u8]) -> Result<f64> {
    str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid number {:?}", Bytes::copy_from_slice(data))))
}
