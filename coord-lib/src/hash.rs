use crate::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::str;

/// A value stored as the fields of a hash.
///
/// `to_fields` yields the `field value` pairs written with `HSET`;
/// `from_fields` rebuilds the value from an `HGETALL` reply. Fields the type
/// does not know about should be ignored so that readers tolerate writers
/// that added fields.
pub trait HashFields: Sized {
    fn to_fields(&self) -> Vec<(String, Bytes)>;

    fn from_fields(fields: HashMap<String, Bytes>) -> Result<Self>;
}

impl HashFields for HashMap<String, String> {
    fn to_fields(&self) -> Vec<(String, Bytes)> {
        self.iter()
            .map(|(field, value)| (field.clone(), Bytes::from(value.clone())))
            .collect()
    }

    fn from_fields(fields: HashMap<String, Bytes>) -> Result<Self> {
        let mut out = HashMap::with_capacity(fields.len());
        for (field, value) in fields {
            let value = utf8(&value)?.to_string();
            out.insert(field, value);
        }
        Ok(out)
    }
}

/// Decode a hash field value as UTF-8.
pub fn utf8(value: &Bytes) -> Result<&str> {
    str::from_utf8(value).map_err(|_| Error::Protocol("invalid utf-8 in hash field".to_string()))
}

/// Decode a hash field value as a decimal integer.
pub fn int64(value: &Bytes) -> Result<i64> {
    utf8(value)?
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid integer field {:?}", value)))
}
