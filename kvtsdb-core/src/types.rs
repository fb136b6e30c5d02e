//! Core types for kvtsdb

use crate::{Result, TsdbError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Timestamp as received from clients: seconds or milliseconds since the epoch
pub type Timestamp = i64;

/// The three kinds of named entity that get a uid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UidKind {
    Metric,
    Tagk,
    Tagv,
}

impl UidKind {
    pub const ALL: [UidKind; 3] = [UidKind::Metric, UidKind::Tagk, UidKind::Tagv];

    pub fn as_str(&self) -> &'static str {
        match self {
            UidKind::Metric => "metric",
            UidKind::Tagk => "tagk",
            UidKind::Tagv => "tagv",
        }
    }

    /// Store kind holding the name/id records for this entity kind
    pub fn store_kind(&self) -> &'static str {
        match self {
            UidKind::Metric => "metric_uid",
            UidKind::Tagk => "tagk_uid",
            UidKind::Tagv => "tagv_uid",
        }
    }
}

impl fmt::Display for UidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UidKind {
    type Err = TsdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "metric" | "metrics" => Ok(UidKind::Metric),
            "tagk" => Ok(UidKind::Tagk),
            "tagv" => Ok(UidKind::Tagv),
            other => Err(TsdbError::UnsupportedKind(other.to_string())),
        }
    }
}

/// Binding between a name and its uid.
///
/// Stored twice: once under `name:<name>` and once under `id:<uid>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidMeta {
    pub uid: String,
    pub name: String,
}

/// A single data point as submitted by a writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub metric: String,
    pub timestamp: Timestamp,
    /// A JSON number, or a string holding one
    #[serde(deserialize_with = "number_or_string")]
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid numeric value '{}'", text))),
    }
}

impl Point {
    /// Create a new point without tags
    pub fn new(metric: impl Into<String>, timestamp: Timestamp, value: f64) -> Self {
        Self {
            metric: metric.into(),
            timestamp,
            value,
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the point
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// An annotation, either bound to one series via `tsuid` or global
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tsuid: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
    pub start_time: Timestamp,
    #[serde(default)]
    pub end_time: Option<Timestamp>,
}

impl Annotation {
    /// Create a global annotation
    pub fn global(start_time: Timestamp, description: impl Into<String>) -> Self {
        Self {
            tsuid: None,
            description: description.into(),
            notes: String::new(),
            custom: BTreeMap::new(),
            start_time,
            end_time: None,
        }
    }

    /// Create an annotation attached to a series
    pub fn for_series(
        tsuid: impl Into<String>,
        start_time: Timestamp,
        description: impl Into<String>,
    ) -> Self {
        Self {
            tsuid: Some(tsuid.into()),
            ..Self::global(start_time, description)
        }
    }

    /// Whether this annotation belongs to the global row
    pub fn is_global(&self) -> bool {
        match self.tsuid.as_deref() {
            None | Some("") | Some("0") => true,
            Some(_) => false,
        }
    }
}

/// One reconstructed time series returned by a range query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub metric: String,
    pub metric_uid: String,
    pub tags: BTreeMap<String, String>,
    pub tsuid: String,
    /// `(timestamp_ms, value)` in ascending timestamp order
    pub dps: Vec<(i64, f64)>,
}

/// A series found by lookup, without data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesDescriptor {
    pub tsuid: String,
    pub metric: String,
    pub tags: BTreeMap<String, String>,
}

/// Tag filter used by lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagPredicate {
    /// `tagk=tagv`
    Exact { tagk: String, tagv: String },
    /// `tagk=*`
    AnyValue { tagk: String },
    /// `*=tagv`
    AnyKey { tagv: String },
}

impl TagPredicate {
    /// Parse `k=v`, `k=*` or `*=v`
    pub fn parse(s: &str) -> Result<Self> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| TsdbError::InvalidInput(format!("Invalid tag predicate: {}", s)))?;
        let (k, v) = (k.trim(), v.trim());
        match (k, v) {
            ("", _) | (_, "") | ("*", "*") => Err(TsdbError::InvalidInput(format!(
                "Invalid tag predicate: {}",
                s
            ))),
            ("*", v) => Ok(TagPredicate::AnyKey { tagv: v.to_string() }),
            (k, "*") => Ok(TagPredicate::AnyValue { tagk: k.to_string() }),
            (k, v) => Ok(TagPredicate::Exact {
                tagk: k.to_string(),
                tagv: v.to_string(),
            }),
        }
    }

    /// Check the predicate against a resolved tag map
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            TagPredicate::Exact { tagk, tagv } => tags.get(tagk) == Some(tagv),
            TagPredicate::AnyValue { tagk } => tags.contains_key(tagk),
            TagPredicate::AnyKey { tagv } => tags.values().any(|v| v == tagv),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_kind_parse() {
        assert_eq!("metric".parse::<UidKind>().unwrap(), UidKind::Metric);
        assert_eq!("metrics".parse::<UidKind>().unwrap(), UidKind::Metric);
        assert_eq!("tagv".parse::<UidKind>().unwrap(), UidKind::Tagv);
        assert!(matches!(
            "tag".parse::<UidKind>(),
            Err(TsdbError::UnsupportedKind(_))
        ));
    }

    #[test]
    fn test_annotation_json() {
        let json = r#"{"tsuid":"000001000001000001","description":"deploy","startTime":1524450000}"#;
        let ann: Annotation = serde_json::from_str(json).unwrap();
        assert_eq!(ann.start_time, 1524450000);
        assert_eq!(ann.end_time, None);
        assert!(!ann.is_global());

        assert!(Annotation::for_series("0", 1, "x").is_global());
        assert!(Annotation::global(1, "x").is_global());
    }

    #[test]
    fn test_point_value_accepts_numeric_strings() {
        let json = r#"{"metric":"cpu","timestamp":1524450000,"value":"23.5","tags":{"host":"a"}}"#;
        let point: Point = serde_json::from_str(json).unwrap();
        assert_eq!(point.value, 23.5);

        let json = r#"{"metric":"cpu","timestamp":1524450000,"value":23}"#;
        assert_eq!(serde_json::from_str::<Point>(json).unwrap().value, 23.0);

        let json = r#"{"metric":"cpu","timestamp":1524450000,"value":"lots"}"#;
        assert!(serde_json::from_str::<Point>(json).is_err());
    }

    #[test]
    fn test_tag_predicates() {
        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), "h1".to_string());
        tags.insert("type".to_string(), "user".to_string());

        assert!(TagPredicate::parse("host=h1").unwrap().matches(&tags));
        assert!(!TagPredicate::parse("host=h2").unwrap().matches(&tags));
        assert!(TagPredicate::parse("type=*").unwrap().matches(&tags));
        assert!(!TagPredicate::parse("dc=*").unwrap().matches(&tags));
        assert!(TagPredicate::parse("*=user").unwrap().matches(&tags));
        assert!(!TagPredicate::parse("*=system").unwrap().matches(&tags));

        assert!(TagPredicate::parse("host").is_err());
        assert!(TagPredicate::parse("*=*").is_err());
        assert!(TagPredicate::parse("=v").is_err());
    }
}
