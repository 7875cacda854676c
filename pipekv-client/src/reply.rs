//! # Reply Decoding
//!
//! Purpose: Turn raw RESP replies into typed values for `ReplyBatch::pop`
//! and append array replies into caller-owned collections.

use crate::client::{ClientError, ClientResult};
use crate::resp::RespValue;

/// Conversion from one raw reply into a typed value.
///
/// Error replies always decode to `ClientError::Server`; any other shape the
/// target cannot represent decodes to `ClientError::TypeMismatch`.
pub trait FromReply: Sized {
    fn from_reply(reply: RespValue) -> ClientResult<Self>;
}

/// Decodes one reply as `T`.
pub fn parse<T: FromReply>(reply: RespValue) -> ClientResult<T> {
    T::from_reply(reply)
}

/// Decodes an array reply element-wise and appends the results to `out`.
///
/// A null array appends nothing. `out` is only touched once every element
/// decoded successfully.
pub fn to_array<T, E>(reply: RespValue, out: &mut E) -> ClientResult<()>
where
    T: FromReply,
    E: Extend<T>,
{
    let items = match server_error(reply)? {
        RespValue::Array(items) => items,
        RespValue::Nil => return Ok(()),
        other => return Err(mismatch("array", &other)),
    };
    let decoded = items
        .into_iter()
        .map(T::from_reply)
        .collect::<ClientResult<Vec<T>>>()?;
    out.extend(decoded);
    Ok(())
}

fn server_error(reply: RespValue) -> ClientResult<RespValue> {
    match reply {
        RespValue::Error(message) => Err(ClientError::Server { message }),
        other => Ok(other),
    }
}

fn mismatch(expected: &'static str, actual: &RespValue) -> ClientError {
    ClientError::TypeMismatch {
        expected,
        actual: actual.kind(),
    }
}

fn is_null(reply: &RespValue) -> bool {
    matches!(reply, RespValue::Bulk(None) | RespValue::Nil)
}

impl FromReply for RespValue {
    fn from_reply(reply: RespValue) -> ClientResult<Self> {
        Ok(reply)
    }
}

impl FromReply for () {
    fn from_reply(reply: RespValue) -> ClientResult<Self> {
        match server_error(reply)? {
            RespValue::Simple(_) => Ok(()),
            other => Err(mismatch("status", &other)),
        }
    }
}

impl FromReply for i64 {
    fn from_reply(reply: RespValue) -> ClientResult<Self> {
        match server_error(reply)? {
            RespValue::Integer(value) => Ok(value),
            other => Err(mismatch("integer", &other)),
        }
    }
}

impl FromReply for bool {
    fn from_reply(reply: RespValue) -> ClientResult<Self> {
        match server_error(reply)? {
            RespValue::Integer(0) => Ok(false),
            RespValue::Integer(1) => Ok(true),
            other => Err(mismatch("0 or 1", &other)),
        }
    }
}

impl FromReply for Vec<u8> {
    fn from_reply(reply: RespValue) -> ClientResult<Self> {
        match server_error(reply)? {
            RespValue::Bulk(Some(data)) | RespValue::Simple(data) => Ok(data),
            other => Err(mismatch("bulk string", &other)),
        }
    }
}

impl FromReply for String {
    fn from_reply(reply: RespValue) -> ClientResult<Self> {
        let data = Vec::<u8>::from_reply(reply)?;
        String::from_utf8(data).map_err(|_| ClientError::TypeMismatch {
            expected: "utf-8 string",
            actual: "binary bulk string",
        })
    }
}

macro_rules! impl_optional {
    ($($ty:ty),*) => {
        $(
            impl FromReply for Option<$ty> {
                fn from_reply(reply: RespValue) -> ClientResult<Self> {
                    if is_null(&reply) {
                        return Ok(None);
                    }
                    <$ty>::from_reply(reply).map(Some)
                }
            }
        )*
    };
}

impl_optional!(Vec<u8>, String, i64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn bulk(data: &[u8]) -> RespValue {
        RespValue::Bulk(Some(data.to_vec()))
    }

    #[test]
    fn parses_scalars() {
        assert_eq!(parse::<i64>(RespValue::Integer(7)).unwrap(), 7);
        assert!(parse::<bool>(RespValue::Integer(1)).unwrap());
        assert_eq!(parse::<String>(bulk(b"hi")).unwrap(), "hi");
        assert_eq!(parse::<Vec<u8>>(RespValue::Simple(b"PONG".to_vec())).unwrap(), b"PONG");
        parse::<()>(RespValue::Simple(b"OK".to_vec())).unwrap();
    }

    #[test]
    fn parses_optional_values() {
        assert_eq!(parse::<Option<String>>(RespValue::Bulk(None)).unwrap(), None);
        assert_eq!(parse::<Option<i64>>(RespValue::Nil).unwrap(), None);
        assert_eq!(
            parse::<Option<Vec<u8>>>(bulk(b"v")).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let err = parse::<i64>(bulk(b"12")).unwrap_err();
        assert!(matches!(
            err,
            ClientError::TypeMismatch { expected: "integer", actual: "bulk string" }
        ));
        let err = parse::<Vec<u8>>(RespValue::Bulk(None)).unwrap_err();
        assert!(matches!(err, ClientError::TypeMismatch { .. }));
        let err = parse::<bool>(RespValue::Integer(3)).unwrap_err();
        assert!(matches!(err, ClientError::TypeMismatch { .. }));
    }

    #[test]
    fn server_errors_surface_for_every_target() {
        let reply = RespValue::Error(b"WRONGTYPE nope".to_vec());
        assert!(matches!(
            parse::<Option<String>>(reply.clone()),
            Err(ClientError::Server { .. })
        ));
        assert!(matches!(parse::<()>(reply.clone()), Err(ClientError::Server { .. })));
        let raw = parse::<RespValue>(reply.clone()).unwrap();
        assert_eq!(raw, reply);
    }

    #[test]
    fn to_array_appends_into_any_extend_target() {
        let reply = RespValue::Array(vec![bulk(b"b"), bulk(b"a"), bulk(b"b")]);
        let mut set = BTreeSet::new();
        to_array::<String, _>(reply, &mut set).unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        let mut values = vec![Some(b"x".to_vec())];
        let reply = RespValue::Array(vec![bulk(b"y"), RespValue::Bulk(None)]);
        to_array::<Option<Vec<u8>>, _>(reply, &mut values).unwrap();
        assert_eq!(values, vec![Some(b"x".to_vec()), Some(b"y".to_vec()), None]);
    }

    #[test]
    fn to_array_is_all_or_nothing() {
        let reply = RespValue::Array(vec![RespValue::Integer(1), bulk(b"two")]);
        let mut out: Vec<i64> = Vec::new();
        assert!(to_array::<i64, _>(reply, &mut out).is_err());
        assert!(out.is_empty());

        to_array::<i64, _>(RespValue::Nil, &mut out).unwrap();
        assert!(out.is_empty());
        assert!(to_array::<i64, _>(RespValue::Integer(1), &mut out).is_err());
    }
}
