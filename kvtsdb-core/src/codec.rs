//! Row key and tsuid encoding
//!
//! A row key is `metric_uid ++ bucket ++ tagk_1 ++ tagv_1 ++ ...` where every
//! field is fixed-width lowercase hex. Fixed widths keep the keys injective
//! and make lexicographic order agree with numeric order, so one metric's
//! buckets form a contiguous, bucket-ascending key range.

use crate::config::{
    TsdbConfig, BUCKET_DURATION_MS, BUCKET_HEX_WIDTH, MAX_BUCKET, MILLISECOND_THRESHOLD,
};
use crate::{Result, Timestamp, TsdbError, UidKind};

/// Decoded row key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub metric_uid: String,
    pub bucket: u32,
    /// Flattened, sorted `tagk tagv` uid pairs
    pub tag_uids: String,
}

impl RowKey {
    /// Tsuid of the series this row belongs to
    pub fn tsuid(&self) -> String {
        format!("{}{}", self.metric_uid, self.tag_uids)
    }
}

/// Fixed-width codec built from the configured uid widths
#[derive(Debug, Clone, Copy)]
pub struct RowKeyCodec {
    metric_hex: usize,
    tagk_hex: usize,
    tagv_hex: usize,
}

impl RowKeyCodec {
    /// Create a codec for the configured widths
    pub fn new(config: &TsdbConfig) -> Self {
        Self {
            metric_hex: config.uid_hex_width(UidKind::Metric),
            tagk_hex: config.uid_hex_width(UidKind::Tagk),
            tagv_hex: config.uid_hex_width(UidKind::Tagv),
        }
    }

    fn hex_width(&self, kind: UidKind) -> usize {
        match kind {
            UidKind::Metric => self.metric_hex,
            UidKind::Tagk => self.tagk_hex,
            UidKind::Tagv => self.tagv_hex,
        }
    }

    fn pair_width(&self) -> usize {
        self.tagk_hex + self.tagv_hex
    }

    /// Format a numeric id as a fixed-width uid, failing if it does not fit
    pub fn format_uid(&self, kind: UidKind, id: u64) -> Result<String> {
        let width = self.hex_width(kind);
        let bits = width * 4;
        if bits < 64 && id >> bits != 0 {
            return Err(TsdbError::SequenceOverflow {
                kind,
                width: width / 2,
            });
        }
        Ok(format!("{:0width$x}", id, width = width))
    }

    /// Parse a uid of the given kind back to its numeric id
    pub fn parse_uid(&self, kind: UidKind, uid: &str) -> Result<u64> {
        check_hex(uid, self.hex_width(kind), kind.as_str())?;
        u64::from_str_radix(uid, 16)
            .map_err(|e| TsdbError::InvalidInput(format!("Invalid {} uid {}: {}", kind, uid, e)))
    }

    /// The all-zero metric uid reserved for global annotations
    pub fn global_metric_uid(&self) -> String {
        "0".repeat(self.metric_hex)
    }

    /// Encode `(metric, bucket, tags)` into a row key
    pub fn encode_row_key(&self, metric_uid: &str, bucket: u32, tag_uids: &str) -> String {
        let mut key = String::with_capacity(metric_uid.len() + BUCKET_HEX_WIDTH + tag_uids.len());
        key.push_str(metric_uid);
        key.push_str(&format!("{:0width$x}", bucket, width = BUCKET_HEX_WIDTH));
        key.push_str(tag_uids);
        key
    }

    /// Decode a row key using the configured widths
    pub fn decode_row_key(&self, key: &str) -> Result<RowKey> {
        let prefix = self.metric_hex + BUCKET_HEX_WIDTH;
        if key.len() < prefix || !key.is_char_boundary(prefix) {
            return Err(TsdbError::Corruption(format!("Row key too short: {}", key)));
        }
        let (metric_uid, rest) = key.split_at(self.metric_hex);
        let (bucket, tag_uids) = rest.split_at(BUCKET_HEX_WIDTH);

        check_hex(metric_uid, self.metric_hex, "metric").map_err(corrupt)?;
        check_hex(bucket, BUCKET_HEX_WIDTH, "bucket").map_err(corrupt)?;
        self.split_tag_uids(tag_uids).map_err(corrupt)?;

        let bucket = u32::from_str_radix(bucket, 16)
            .map_err(|e| TsdbError::Corruption(format!("Invalid bucket in {}: {}", key, e)))?;

        Ok(RowKey {
            metric_uid: metric_uid.to_string(),
            bucket,
            tag_uids: tag_uids.to_string(),
        })
    }

    /// Half-open key range covering `start_bucket..=end_bucket` of a metric
    pub fn bucket_range(
        &self,
        metric_uid: &str,
        start_bucket: u32,
        end_bucket: u32,
    ) -> Result<(String, Option<String>)> {
        let start = self.encode_row_key(metric_uid, start_bucket, "");
        if i64::from(end_bucket) < MAX_BUCKET {
            return Ok((start, Some(self.encode_row_key(metric_uid, end_bucket + 1, ""))));
        }
        let (_, end) = self.metric_range(metric_uid)?;
        Ok((start, end))
    }

    /// Half-open key range covering every row of a metric
    pub fn metric_range(&self, metric_uid: &str) -> Result<(String, Option<String>)> {
        let id = self.parse_uid(UidKind::Metric, metric_uid)?;
        let end = id
            .checked_add(1)
            .and_then(|next| self.format_uid(UidKind::Metric, next).ok());
        Ok((metric_uid.to_string(), end))
    }

    /// Concatenate sorted `(tagk, tagv)` uid pairs
    pub fn join_tag_uids(pairs: &[(String, String)]) -> String {
        pairs.iter().map(|(k, v)| format!("{}{}", k, v)).collect()
    }

    /// Split a flattened tag uid string into `(tagk, tagv)` pairs
    pub fn split_tag_uids(&self, tag_uids: &str) -> Result<Vec<(String, String)>> {
        let pair = self.pair_width();
        if tag_uids.len() % pair != 0 || !tag_uids.is_ascii() {
            return Err(TsdbError::InvalidInput(format!(
                "Tag uid string {} is not a whole number of pairs",
                tag_uids
            )));
        }
        let mut pairs = Vec::with_capacity(tag_uids.len() / pair);
        let mut rest = tag_uids;
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(pair);
            let (k, v) = chunk.split_at(self.tagk_hex);
            check_hex(k, self.tagk_hex, "tagk")?;
            check_hex(v, self.tagv_hex, "tagv")?;
            pairs.push((k.to_string(), v.to_string()));
            rest = tail;
        }
        Ok(pairs)
    }

    /// Build a tsuid from a metric uid and sorted tag pairs
    pub fn compose_tsuid(&self, metric_uid: &str, pairs: &[(String, String)]) -> String {
        format!("{}{}", metric_uid, Self::join_tag_uids(pairs))
    }

    /// Split a tsuid into its metric uid and tag pairs
    pub fn decompose_tsuid(&self, tsuid: &str) -> Result<(String, Vec<(String, String)>)> {
        if tsuid.len() < self.metric_hex || !tsuid.is_char_boundary(self.metric_hex) {
            return Err(TsdbError::InvalidInput(format!("Tsuid too short: {}", tsuid)));
        }
        let (metric_uid, tags) = tsuid.split_at(self.metric_hex);
        check_hex(metric_uid, self.metric_hex, "metric")?;
        let pairs = self.split_tag_uids(tags)?;
        Ok((metric_uid.to_string(), pairs))
    }
}

/// Convert a second or millisecond timestamp to milliseconds
pub fn normalize_timestamp(timestamp: Timestamp) -> Result<i64> {
    if timestamp < 0 {
        return Err(TsdbError::InvalidInput(format!(
            "Negative timestamp: {}",
            timestamp
        )));
    }
    if timestamp > MILLISECOND_THRESHOLD {
        Ok(timestamp)
    } else {
        Ok(timestamp * 1000)
    }
}

/// Bucket number and millisecond offset within it for a timestamp
pub fn bucket_of(timestamp: Timestamp) -> Result<(u32, u32)> {
    let ms = normalize_timestamp(timestamp)?;
    let bucket = ms / BUCKET_DURATION_MS;
    if bucket > MAX_BUCKET {
        return Err(TsdbError::InvalidInput(format!(
            "Timestamp {} is beyond the last representable bucket",
            timestamp
        )));
    }
    Ok((bucket as u32, (ms % BUCKET_DURATION_MS) as u32))
}

/// Absolute millisecond timestamp of an offset within a bucket
pub fn timestamp_of(bucket: u32, offset: u32) -> i64 {
    i64::from(bucket) * BUCKET_DURATION_MS + i64::from(offset)
}

fn check_hex(s: &str, width: usize, what: &str) -> Result<()> {
    if s.len() != width || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(TsdbError::InvalidInput(format!(
            "Invalid {} uid '{}': expected {} lowercase hex digits",
            what, s, width
        )));
    }
    Ok(())
}

fn corrupt(err: TsdbError) -> TsdbError {
    TsdbError::Corruption(err.to_string())
}
