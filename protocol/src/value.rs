use chrono::{NaiveDate, NaiveDateTime};
use tether_std::errors::RemoteError;

use crate::datetime::{date_to_int8, datetime_to_int14, int14_to_datetime, int8_to_date};

pub const EXT_DATAFRAME: i8 = 1;
pub const EXT_NDARRAY: i8 = 3;
pub const EXT_DATE: i8 = 5;
pub const EXT_DATETIME: i8 = 6;

/// The dynamic payload universe. Temporal values are first-class and travel
/// as the reserved extension types; extension codes this crate does not
/// understand pass through untouched for caller inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    F64(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Ext(i8, Vec<u8>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub(crate) fn to_rmpv(&self) -> rmpv::Value {
        match self {
            Value::Nil => rmpv::Value::Nil,
            Value::Bool(b) => rmpv::Value::Boolean(*b),
            Value::Int(i) => rmpv::Value::from(*i),
            Value::Uint(u) => rmpv::Value::from(*u),
            Value::F64(f) => rmpv::Value::F64(*f),
            Value::Str(s) => rmpv::Value::String(s.clone().into()),
            Value::Bin(b) => rmpv::Value::Binary(b.clone()),
            Value::Array(items) => {
                rmpv::Value::Array(items.iter().map(Value::to_rmpv).collect())
            }
            Value::Map(pairs) => rmpv::Value::Map(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_rmpv(), v.to_rmpv()))
                    .collect(),
            ),
            Value::Date(date) => {
                let body = date_to_int8(*date).to_be_bytes().to_vec();
                rmpv::Value::Ext(EXT_DATE, body)
            }
            Value::DateTime(datetime) => {
                let packed = datetime_to_int14(*datetime).to_be_bytes();
                rmpv::Value::Ext(EXT_DATETIME, packed[2..].to_vec())
            }
            Value::Ext(code, body) => rmpv::Value::Ext(*code, body.clone()),
        }
    }

    pub(crate) fn from_rmpv(value: rmpv::Value) -> Result<Value, RemoteError> {
        match value {
            rmpv::Value::Nil => Ok(Value::Nil),
            rmpv::Value::Boolean(b) => Ok(Value::Bool(b)),
            rmpv::Value::Integer(i) => i
                .as_i64()
                .map(Value::Int)
                .or_else(|| i.as_u64().map(Value::Uint))
                .ok_or_else(|| RemoteError::PackUnpack(format!("unrepresentable integer: {i}"))),
            rmpv::Value::F32(f) => Ok(Value::F64(f as f64)),
            rmpv::Value::F64(f) => Ok(Value::F64(f)),
            rmpv::Value::String(s) => match s.into_str() {
                Some(s) => Ok(Value::Str(s)),
                None => Err(RemoteError::PackUnpack("invalid utf-8 string".into())),
            },
            rmpv::Value::Binary(b) => Ok(Value::Bin(b)),
            rmpv::Value::Array(items) => items
                .into_iter()
                .map(Value::from_rmpv)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            rmpv::Value::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| Ok((Value::from_rmpv(k)?, Value::from_rmpv(v)?)))
                .collect::<Result<Vec<_>, RemoteError>>()
                .map(Value::Map),
            rmpv::Value::Ext(code, body) => ext_hook(code, body),
        }
    }
}

fn ext_hook(code: i8, body: Vec<u8>) -> Result<Value, RemoteError> {
    match code {
        EXT_DATE => {
            let raw: [u8; 4] = body
                .as_slice()
                .try_into()
                .map_err(|_| RemoteError::PackUnpack(format!("date body of {} bytes", body.len())))?;
            int8_to_date(i32::from_be_bytes(raw))
                .map(Value::Date)
                .ok_or_else(|| RemoteError::PackUnpack("invalid date value".into()))
        }
        EXT_DATETIME => {
            if body.len() != 6 {
                return Err(RemoteError::PackUnpack(format!(
                    "datetime body of {} bytes",
                    body.len()
                )));
            }
            let fill = if body[0] & 0x80 != 0 { 0xff } else { 0 };
            let mut raw = [fill; 8];
            raw[2..].copy_from_slice(&body);
            int14_to_datetime(i64::from_be_bytes(raw))
                .map(Value::DateTime)
                .ok_or_else(|| RemoteError::PackUnpack("invalid datetime value".into()))
        }
        _ => Ok(Value::Ext(code, body)),
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::DateTime(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value) -> Value {
        Value::from_rmpv(value.to_rmpv()).unwrap()
    }

    #[test]
    fn test_scalar_round_trips() {
        let values = [
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Uint(u64::MAX),
            Value::F64(3.5),
            Value::Str("hello".into()),
            Value::Bin(vec![0, 1, 2, 255]),
        ];

        for value in values {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn test_positive_int_stays_int() {
        assert_eq!(round_trip(&Value::Int(7)), Value::Int(7));
        assert_eq!(round_trip(&Value::Uint(7)), Value::Int(7));
    }

    #[test]
    fn test_nested_round_trip() {
        let value = Value::Map(vec![
            (Value::Str("rows".into()), Value::Array(vec![Value::Int(1), Value::Nil])),
            (Value::Str("ok".into()), Value::Bool(true)),
        ]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_date_ext_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let encoded = Value::Date(date).to_rmpv();
        assert_eq!(
            encoded,
            rmpv::Value::Ext(EXT_DATE, 20240229i32.to_be_bytes().to_vec())
        );
        assert_eq!(Value::from_rmpv(encoded).unwrap(), Value::Date(date));
    }

    #[test]
    fn test_datetime_ext_round_trip() {
        let datetime = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 30, 59)
            .unwrap();
        let encoded = Value::DateTime(datetime).to_rmpv();
        match &encoded {
            rmpv::Value::Ext(code, body) => {
                assert_eq!(*code, EXT_DATETIME);
                assert_eq!(body.len(), 6);
            }
            other => panic!("unexpected encoding: {other:?}"),
        }
        assert_eq!(Value::from_rmpv(encoded).unwrap(), Value::DateTime(datetime));
    }

    #[test]
    fn test_datetime_truncates_to_seconds() {
        let datetime = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_milli_opt(8, 15, 3, 250)
            .unwrap();
        let truncated = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(8, 15, 3)
            .unwrap();
        assert_eq!(round_trip(&Value::DateTime(datetime)), Value::DateTime(truncated));
    }

    #[test]
    fn test_unknown_ext_passes_through() {
        let value = Value::Ext(42, vec![1, 2, 3]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_tabular_ext_codes_pass_through() {
        let frame = Value::Ext(EXT_DATAFRAME, b"#type:dataframe\n".to_vec());
        assert_eq!(round_trip(&frame), frame);
        let array = Value::Ext(EXT_NDARRAY, b"#type:ndarray\n".to_vec());
        assert_eq!(round_trip(&array), array);
    }

    #[test]
    fn test_malformed_temporal_ext_fails() {
        let err = Value::from_rmpv(rmpv::Value::Ext(EXT_DATE, vec![1, 2])).unwrap_err();
        assert!(matches!(err, RemoteError::PackUnpack(_)));

        // 20211301 is not a calendar date
        let err = Value::from_rmpv(rmpv::Value::Ext(
            EXT_DATE,
            20211301i32.to_be_bytes().to_vec(),
        ))
        .unwrap_err();
        assert_eq!(err.code(), 510);
    }
}
