//! Property types and values with the repository's conversion rules.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Property type tag. Discriminants match the numeric codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    String = 1,
    Binary = 2,
    Long = 3,
    Double = 4,
    Date = 5,
    Boolean = 6,
    Name = 7,
    Path = 8,
    Reference = 9,
    WeakReference = 10,
    Uri = 11,
    Decimal = 12,
}

impl PropertyType {
    pub const ALL: [PropertyType; 12] = [
        PropertyType::String,
        PropertyType::Binary,
        PropertyType::Long,
        PropertyType::Double,
        PropertyType::Date,
        PropertyType::Boolean,
        PropertyType::Name,
        PropertyType::Path,
        PropertyType::Reference,
        PropertyType::WeakReference,
        PropertyType::Uri,
        PropertyType::Decimal,
    ];

    /// Canonical type name, as used in JSON type hints.
    pub fn name(self) -> &'static str {
        match self {
            PropertyType::String => "String",
            PropertyType::Binary => "Binary",
            PropertyType::Long => "Long",
            PropertyType::Double => "Double",
            PropertyType::Date => "Date",
            PropertyType::Boolean => "Boolean",
            PropertyType::Name => "Name",
            PropertyType::Path => "Path",
            PropertyType::Reference => "Reference",
            PropertyType::WeakReference => "WeakReference",
            PropertyType::Uri => "URI",
            PropertyType::Decimal => "Decimal",
        }
    }

    /// Parse a type name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        PropertyType::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::ValueFormat(format!("unknown property type '{}'", name)))
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        PropertyType::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or_else(|| Error::ValueFormat(format!("unknown property type code {}", code)))
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single property value in native form.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Binary(Bytes),
    Long(i64),
    Double(f64),
    Date(DateTime<FixedOffset>),
    Boolean(bool),
    Name(String),
    Path(String),
    Reference(String),
    WeakReference(String),
    Uri(String),
    Decimal(String),
}

impl Value {
    pub fn kind(&self) -> PropertyType {
        match self {
            Value::String(_) => PropertyType::String,
            Value::Binary(_) => PropertyType::Binary,
            Value::Long(_) => PropertyType::Long,
            Value::Double(_) => PropertyType::Double,
            Value::Date(_) => PropertyType::Date,
            Value::Boolean(_) => PropertyType::Boolean,
            Value::Name(_) => PropertyType::Name,
            Value::Path(_) => PropertyType::Path,
            Value::Reference(_) => PropertyType::Reference,
            Value::WeakReference(_) => PropertyType::WeakReference,
            Value::Uri(_) => PropertyType::Uri,
            Value::Decimal(_) => PropertyType::Decimal,
        }
    }

    /// String form of the value, as sent in value parts.
    pub fn to_jcr_string(&self) -> String {
        match self {
            Value::String(s)
            | Value::Name(s)
            | Value::Path(s)
            | Value::Reference(s)
            | Value::WeakReference(s)
            | Value::Uri(s)
            | Value::Decimal(s) => s.clone(),
            Value::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Long(v) => v.to_string(),
            Value::Double(v) => format_double(*v),
            Value::Date(d) => format_date(d),
            Value::Boolean(b) => b.to_string(),
        }
    }

    /// Textual payload for the string-backed variants.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s)
            | Value::Name(s)
            | Value::Path(s)
            | Value::Reference(s)
            | Value::WeakReference(s)
            | Value::Uri(s)
            | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Parse text into a value of the given type.
    pub fn parse(text: &str, kind: PropertyType) -> Result<Value> {
        Value::String(text.to_string()).convert(kind)
    }

    /// Convert to another property type following the repository rules.
    pub fn convert(&self, target: PropertyType) -> Result<Value> {
        if self.kind() == target {
            return Ok(self.clone());
        }

        let fail = || {
            Error::ValueFormat(format!(
                "cannot convert {} value '{}' to {}",
                self.kind(),
                self.to_jcr_string(),
                target
            ))
        };

        match target {
            PropertyType::String => Ok(Value::String(self.to_jcr_string())),
            PropertyType::Binary => Ok(Value::Binary(Bytes::from(self.to_jcr_string()))),
            PropertyType::Long => match self {
                Value::Double(v) => Ok(Value::Long(v.trunc() as i64)),
                Value::Date(d) => Ok(Value::Long(d.timestamp_millis())),
                Value::String(_) | Value::Binary(_) | Value::Decimal(_) => {
                    let text = self.to_jcr_string();
                    let text = text.trim();
                    if let Ok(v) = text.parse::<i64>() {
                        return Ok(Value::Long(v));
                    }
                    match (self, text.parse::<f64>()) {
                        (Value::Decimal(_), Ok(v)) => Ok(Value::Long(v.trunc() as i64)),
                        _ => Err(fail()),
                    }
                }
                _ => Err(fail()),
            },
            PropertyType::Double => match self {
                Value::Long(v) => Ok(Value::Double(*v as f64)),
                Value::Date(d) => Ok(Value::Double(d.timestamp_millis() as f64)),
                Value::String(_) | Value::Binary(_) | Value::Decimal(_) => self
                    .to_jcr_string()
                    .trim()
                    .parse::<f64>()
                    .map(Value::Double)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            PropertyType::Decimal => match self {
                Value::Long(v) => Ok(Value::Decimal(v.to_string())),
                Value::Double(v) => Ok(Value::Decimal(format_double(*v))),
                Value::Date(d) => Ok(Value::Decimal(d.timestamp_millis().to_string())),
                Value::String(_) | Value::Binary(_) => {
                    let text = self.to_jcr_string().trim().to_string();
                    text.parse::<f64>().map_err(|_| fail())?;
                    Ok(Value::Decimal(text))
                }
                _ => Err(fail()),
            },
            PropertyType::Date => match self {
                Value::Long(v) => millis_to_date(*v).map(Value::Date).ok_or_else(fail),
                Value::Double(v) => millis_to_date(*v as i64).map(Value::Date).ok_or_else(fail),
                Value::Decimal(s) => s
                    .parse::<f64>()
                    .ok()
                    .and_then(|v| millis_to_date(v as i64))
                    .map(Value::Date)
                    .ok_or_else(fail),
                Value::String(_) | Value::Binary(_) => {
                    parse_date(self.to_jcr_string().trim()).map(Value::Date).map_err(|_| fail())
                }
                _ => Err(fail()),
            },
            PropertyType::Boolean => match self {
                Value::String(_) | Value::Binary(_) => Ok(Value::Boolean(
                    self.to_jcr_string().trim().eq_ignore_ascii_case("true"),
                )),
                _ => Err(fail()),
            },
            PropertyType::Name => match self {
                Value::String(_) | Value::Binary(_) | Value::Path(_) | Value::Uri(_) => {
                    let text = self.to_jcr_string();
                    if text.is_empty() || text.contains('/') {
                        return Err(fail());
                    }
                    Ok(Value::Name(text))
                }
                _ => Err(fail()),
            },
            PropertyType::Path => match self {
                Value::String(_) | Value::Binary(_) | Value::Name(_) | Value::Uri(_) => {
                    Ok(Value::Path(self.to_jcr_string()))
                }
                _ => Err(fail()),
            },
            PropertyType::Reference | PropertyType::WeakReference => match self {
                Value::String(_) | Value::Binary(_) | Value::Reference(_) | Value::WeakReference(_) => {
                    let text = self.to_jcr_string();
                    if target == PropertyType::Reference {
                        Ok(Value::Reference(text))
                    } else {
                        Ok(Value::WeakReference(text))
                    }
                }
                _ => Err(fail()),
            },
            PropertyType::Uri => match self {
                Value::String(_) | Value::Binary(_) | Value::Name(_) | Value::Path(_) => {
                    Ok(Value::Uri(self.to_jcr_string()))
                }
                _ => Err(fail()),
            },
        }
    }

    pub fn as_long(&self) -> Result<i64> {
        match self.convert(PropertyType::Long)? {
            Value::Long(v) => Ok(v),
            _ => unreachable!("convert returns the requested type"),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self.convert(PropertyType::Double)? {
            Value::Double(v) => Ok(v),
            _ => unreachable!("convert returns the requested type"),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self.convert(PropertyType::Boolean)? {
            Value::Boolean(v) => Ok(v),
            _ => unreachable!("convert returns the requested type"),
        }
    }

    pub fn as_date(&self) -> Result<DateTime<FixedOffset>> {
        match self.convert(PropertyType::Date)? {
            Value::Date(v) => Ok(v),
            _ => unreachable!("convert returns the requested type"),
        }
    }

    /// Byte length of the string form (binaries: raw length).
    pub fn len(&self) -> usize {
        match self {
            Value::Binary(b) => b.len(),
            other => other.to_jcr_string().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_jcr_string())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Binary(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(v))
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v.fixed_offset())
    }
}

/// ISO-8601 with milliseconds and explicit offset, e.g.
/// `2011-04-21T14:34:20.431+01:00`.
pub fn format_date(date: &DateTime<FixedOffset>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}

pub fn parse_date(text: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map_err(|e| Error::ValueFormat(format!("invalid date '{}': {}", text, e)))
}

fn millis_to_date(millis: i64) -> Option<DateTime<FixedOffset>> {
    Utc.timestamp_millis_opt(millis).single().map(|d| d.fixed_offset())
}

fn format_double(v: f64) -> String {
    if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_round_trip() {
        for t in PropertyType::ALL {
            assert_eq!(PropertyType::from_name(t.name()).unwrap(), t);
            assert_eq!(PropertyType::from_code(t.code()).unwrap(), t);
        }
        assert_eq!(PropertyType::from_name("weakreference").unwrap(), PropertyType::WeakReference);
        assert_eq!(PropertyType::Uri.code(), 11);
        assert!(PropertyType::from_name("Float").is_err());
    }

    #[test]
    fn test_string_conversions() {
        assert_eq!(Value::parse("42", PropertyType::Long).unwrap(), Value::Long(42));
        assert_eq!(Value::parse("4.5", PropertyType::Double).unwrap(), Value::Double(4.5));
        assert_eq!(Value::parse("TRUE", PropertyType::Boolean).unwrap(), Value::Boolean(true));
        assert_eq!(Value::parse("nope", PropertyType::Boolean).unwrap(), Value::Boolean(false));
        assert!(Value::parse("abc", PropertyType::Long).is_err());
        assert!(Value::parse("a/b", PropertyType::Name).is_err());
        assert_eq!(
            Value::parse("/a/b", PropertyType::Path).unwrap(),
            Value::Path("/a/b".to_string())
        );
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(Value::Double(3.9).convert(PropertyType::Long).unwrap(), Value::Long(3));
        assert_eq!(Value::Long(3).convert(PropertyType::Double).unwrap(), Value::Double(3.0));
        assert_eq!(
            Value::Long(7).convert(PropertyType::Decimal).unwrap(),
            Value::Decimal("7".to_string())
        );
        assert_eq!(Value::Decimal("2.5".into()).as_long().unwrap(), 2);
        assert!(Value::Boolean(true).convert(PropertyType::Long).is_err());
    }

    #[test]
    fn test_dates() {
        let date = parse_date("2011-04-21T14:34:20.431+01:00").unwrap();
        assert_eq!(format_date(&date), "2011-04-21T14:34:20.431+01:00");
        let zulu = parse_date("2011-04-21T13:34:20Z").unwrap();
        assert_eq!(format_date(&zulu), "2011-04-21T13:34:20.000+00:00");

        let millis = Value::Date(date).as_long().unwrap();
        let back = Value::Long(millis).as_date().unwrap();
        assert_eq!(back.timestamp_millis(), date.timestamp_millis());
    }

    #[test]
    fn test_to_string_and_len() {
        assert_eq!(Value::Double(2.0).to_jcr_string(), "2.0");
        assert_eq!(Value::Boolean(false).to_jcr_string(), "false");
        assert_eq!(Value::from(vec![1u8, 2, 3]).len(), 3);
        assert_eq!(Value::from("héllo").len(), 6);
    }
}
