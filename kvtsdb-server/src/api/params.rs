//! Query-string parsing for OpenTSDB-style parameters

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use kvtsdb_core::config::MILLISECOND_THRESHOLD;
use kvtsdb_core::TagPredicate;
use regex::Regex;
use std::sync::OnceLock;

/// Parse a start/end parameter into a core timestamp.
///
/// Accepts `now`, relative times like `1h-ago`, absolute dates
/// (`2018/04/23-02:20:00`, `2018/04/23 02:20`, `2018/04/23`) and integer
/// timestamps in seconds or milliseconds (passed through unchanged).
/// Computed times are encoded with [`from_millis`] so the core's
/// seconds-or-milliseconds rule reads them back as the same instant.
pub fn parse_time(raw: &str, now: DateTime<Utc>) -> Result<i64, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("now") {
        return Ok(from_millis(now.timestamp_millis()));
    }
    if let Some(relative) = raw.strip_suffix("-ago") {
        return parse_relative(relative).map(|ms| from_millis(now.timestamp_millis() - ms));
    }
    if let Ok(ts) = raw.parse::<i64>() {
        return Ok(ts);
    }
    for format in ["%Y/%m/%d-%H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y/%m/%d-%H:%M", "%Y/%m/%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(from_millis(dt.and_utc().timestamp_millis()));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y/%m/%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(from_millis(dt.and_utc().timestamp_millis()));
        }
    }
    Err(format!("Invalid time: {}", raw))
}

/// Millisecond instant as a core timestamp: milliseconds where the core would
/// read them as milliseconds, otherwise seconds (sub-second part dropped)
fn from_millis(ms: i64) -> i64 {
    if ms > MILLISECOND_THRESHOLD {
        ms
    } else {
        ms.div_euclid(1000)
    }
}

/// `<amount><unit>` to milliseconds
fn parse_relative(raw: &str) -> Result<i64, String> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("Missing unit in relative time: {}", raw))?;
    let (amount, unit) = raw.split_at(split);
    let amount: i64 = amount
        .parse()
        .map_err(|_| format!("Invalid relative time: {}", raw))?;
    let unit_ms = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "n" => 30 * 86_400_000,
        "y" => 365 * 86_400_000,
        other => return Err(format!("Unknown time unit: {}", other)),
    };
    amount
        .checked_mul(unit_ms)
        .ok_or_else(|| format!("Relative time out of range: {}", raw))
}

/// A parsed `m=` sub query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricQuery {
    /// Leading aggregator token, accepted but not applied
    pub aggregator: Option<String>,
    pub metric: String,
    pub filters: Vec<TagPredicate>,
}

fn metric_expr() -> Result<&'static Regex, String> {
    static RE: OnceLock<Result<Regex, String>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<prefix>(?:[^:{}]+:)*)(?P<metric>[^:{}]*)(?:\{(?P<tags>[^{}]*)\})?$")
            .map_err(|e| e.to_string())
    })
    .as_ref()
    .map_err(Clone::clone)
}

/// Parse `[agg:[downsample:]]metric[{k=v,...}]`
pub fn parse_metric_query(raw: &str) -> Result<MetricQuery, String> {
    let caps = metric_expr()?
        .captures(raw.trim())
        .ok_or_else(|| format!("Invalid metric query: {}", raw))?;

    let aggregator = caps
        .name("prefix")
        .and_then(|p| p.as_str().split(':').next())
        .filter(|agg| !agg.is_empty())
        .map(str::to_string);
    let metric = caps
        .name("metric")
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    let filters = match caps.name("tags") {
        Some(tags) => parse_tags(tags.as_str())?,
        None => Vec::new(),
    };

    Ok(MetricQuery {
        aggregator,
        metric,
        filters,
    })
}

fn parse_tags(raw: &str) -> Result<Vec<TagPredicate>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| TagPredicate::parse(t).map_err(|e| e.to_string()))
        .collect()
}

/// Interpret a flag parameter: present without a value, or a truthy value
pub fn flag(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => matches!(v, "" | "true" | "1" | "yes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kvtsdb_core::codec::normalize_timestamp;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 4, 23, 3, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("1524450000", now()).unwrap(), 1524450000);
        assert_eq!(parse_time("now", now()).unwrap(), 1524452400000);
        assert_eq!(parse_time("1h-ago", now()).unwrap(), 1524448800000);
        assert_eq!(parse_time("30m-ago", now()).unwrap(), 1524450600000);
        assert_eq!(
            parse_time("2018/04/23-02:20:00", now()).unwrap(),
            1524450000000
        );
        assert_eq!(parse_time("2018/04/23", now()).unwrap(), 1524441600000);
        assert!(parse_time("1x-ago", now()).is_err());
        assert!(parse_time("h-ago", now()).is_err());
        assert!(parse_time("yesterday", now()).is_err());
    }

    #[test]
    fn test_early_dates_keep_their_instant() {
        // 1970-02-01 in ms is below the seconds/ms threshold
        let ts = parse_time("1970/02/01", now()).unwrap();
        assert_eq!(ts, 2_678_400);
        assert_eq!(normalize_timestamp(ts).unwrap(), 2_678_400_000);

        let ts = parse_time("1970/02/01-00:00:30", now()).unwrap();
        assert_eq!(normalize_timestamp(ts).unwrap(), 2_678_430_000);

        let late = parse_time("2018/04/23-02:20:00", now()).unwrap();
        assert_eq!(normalize_timestamp(late).unwrap(), 1524450000000);
    }

    #[test]
    fn test_parse_metric_query() {
        let q = parse_metric_query("sum:cpu.percent").unwrap();
        assert_eq!(q.aggregator.as_deref(), Some("sum"));
        assert_eq!(q.metric, "cpu.percent");
        assert!(q.filters.is_empty());

        let q = parse_metric_query("sum:10s-avg:disk.used.bytes{host=host001, volume=*}").unwrap();
        assert_eq!(q.aggregator.as_deref(), Some("sum"));
        assert_eq!(q.metric, "disk.used.bytes");
        assert_eq!(
            q.filters,
            vec![
                TagPredicate::Exact {
                    tagk: "host".into(),
                    tagv: "host001".into()
                },
                TagPredicate::AnyValue {
                    tagk: "volume".into()
                },
            ]
        );

        let q = parse_metric_query("cpu{*=user}").unwrap();
        assert_eq!(q.aggregator, None);
        assert_eq!(q.filters.len(), 1);

        let q = parse_metric_query("{host=a}").unwrap();
        assert!(q.metric.is_empty());

        assert!(parse_metric_query("cpu{host}").is_err());
        assert!(parse_metric_query("cpu{a=b").is_err());
    }

    #[test]
    fn test_flag() {
        assert!(flag(Some("")));
        assert!(flag(Some("true")));
        assert!(!flag(Some("false")));
        assert!(!flag(None));
    }
}
