//! Ledger record aggregation.
//!
//! Groups records by the requested dimensions and buckets them on a regular
//! time grid. Empty buckets are synthesized with zero cost, so every series
//! handed to detection and forecasting is gap-free and all series from one call
//! share the same grid.

use crate::error::{CostError, Result};
use chrono::{DateTime, Duration, Utc};
use costwatch_abstraction::{CostRecord, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Dimensions accepted by [`Aggregator`].
pub const SUPPORTED_DIMENSIONS: [&str; 4] = ["date", "user", "dataset", "query_type"];

/// Key used for the series when no grouping dimension was requested.
pub const TOTAL_KEY: &str = "total";

/// Aggregation dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// The time bucket itself.
    Date,
    /// Submitting principal.
    User,
    /// Dataset read.
    Dataset,
    /// Statement class.
    QueryType,
}

impl Dimension {
    /// Canonical name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::User => "user",
            Self::Dataset => "dataset",
            Self::QueryType => "query_type",
        }
    }

    /// Whether the dimension identifies individual users.
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::User)
    }

    fn value_of<'a>(&self, record: &'a CostRecord) -> Option<&'a str> {
        match self {
            Self::Date => None,
            Self::User => Some(&record.user),
            Self::Dataset => Some(&record.dataset),
            Self::QueryType => Some(&record.query_class),
        }
    }
}

impl AsRef<str> for Dimension {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = CostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "date" => Ok(Self::Date),
            "user" => Ok(Self::User),
            "dataset" => Ok(Self::Dataset),
            "query_type" => Ok(Self::QueryType),
            _ => Err(CostError::InvalidDimension {
                dimension: s.to_string(),
                allowed: SUPPORTED_DIMENSIONS.join(", "),
            }),
        }
    }
}

/// Parses dimension names, rejecting anything outside the supported set.
///
/// # Errors
/// Returns `InvalidDimension` echoing the first unknown name.
pub fn parse_dimensions<S: AsRef<str>>(names: &[S]) -> Result<Vec<Dimension>> {
    let mut dims = Vec::with_capacity(names.len());
    for name in names {
        let dim: Dimension = name.as_ref().parse()?;
        if !dims.contains(&dim) {
            dims.push(dim);
        }
    }
    Ok(dims)
}

/// One time bucket of a cost series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBucket {
    /// Start of the bucket.
    pub period_start: DateTime<Utc>,
    /// Summed cost in USD.
    pub total_cost_usd: f64,
    /// Number of records in the bucket.
    pub record_count: u64,
    /// Summed bytes processed.
    pub bytes_processed: u64,
}

impl CostBucket {
    fn empty(period_start: DateTime<Utc>) -> Self {
        Self { period_start, total_cost_usd: 0.0, record_count: 0, bytes_processed: 0 }
    }
}

/// Time-ordered, gap-free cost series for one dimension key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSeries {
    /// Grouping key, e.g. `dataset=sales` or `total`.
    pub dimension_key: String,
    /// Buckets in ascending time order.
    pub buckets: Vec<CostBucket>,
}

impl CostSeries {
    /// Builds a daily series from raw values starting at `start` (handy for tests
    /// and benchmarks).
    #[must_use]
    pub fn from_daily_values(dimension_key: &str, start: DateTime<Utc>, values: &[f64]) -> Self {
        let buckets = values
            .iter()
            .enumerate()
            .map(|(i, v)| CostBucket {
                period_start: start + Duration::days(i as i64),
                total_cost_usd: *v,
                record_count: u64::from(*v > 0.0),
                bytes_processed: 0,
            })
            .collect();
        Self { dimension_key: dimension_key.to_string(), buckets }
    }

    /// Cost values in time order.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        self.buckets.iter().map(|b| b.total_cost_usd).collect()
    }

    /// Total cost across all buckets.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.buckets.iter().map(|b| b.total_cost_usd).sum()
    }

    /// Number of buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the series has no buckets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Sums series that share one grid into a single `total` series.
    ///
    /// Returns `None` for an empty slice.
    #[must_use]
    pub fn sum_of(series: &[Self]) -> Option<Self> {
        let (first, rest) = series.split_first()?;
        let mut total = Self { dimension_key: TOTAL_KEY.to_string(), buckets: first.buckets.clone() };
        for other in rest {
            for (bucket, add) in total.buckets.iter_mut().zip(&other.buckets) {
                bucket.total_cost_usd += add.total_cost_usd;
                bucket.record_count += add.record_count;
                bucket.bytes_processed += add.bytes_processed;
            }
        }
        Some(total)
    }
}

/// Groups and buckets ledger records.
pub struct Aggregator;

impl Aggregator {
    /// Default bucket width.
    #[must_use]
    pub fn default_bucket() -> Duration {
        Duration::days(1)
    }

    /// Aggregates `records` over their own time extent.
    ///
    /// One series per distinct combination of the requested non-time dimensions,
    /// sorted by key.
    ///
    /// # Errors
    /// Returns `InvalidDimension` for unknown dimension names and
    /// `InvalidParameter` for a non-positive bucket size.
    pub fn aggregate<S: AsRef<str>>(
        records: &[CostRecord],
        dimensions: &[S],
        bucket_size: Duration,
    ) -> Result<Vec<CostSeries>> {
        let dims = parse_dimensions(dimensions)?;
        let bucket_secs = bucket_seconds(bucket_size)?;

        let (Some(min), Some(max)) = (
            records.iter().map(|r| r.timestamp).min(),
            records.iter().map(|r| r.timestamp).max(),
        ) else {
            return Ok(Vec::new());
        };

        let range = TimeRange::new(min, max + Duration::nanoseconds(1));
        Ok(build_series(records, &dims, bucket_secs, &range))
    }

    /// Aggregates the records falling inside `range`, gridding over the whole range.
    ///
    /// With no grouping dimension the result is a single `total` series even
    /// when no record falls inside the range.
    ///
    /// # Errors
    /// Same as [`Aggregator::aggregate`], plus `InvalidParameter` for an empty range.
    pub fn aggregate_in_range<S: AsRef<str>>(
        records: &[CostRecord],
        dimensions: &[S],
        bucket_size: Duration,
        range: &TimeRange,
    ) -> Result<Vec<CostSeries>> {
        let dims = parse_dimensions(dimensions)?;
        let bucket_secs = bucket_seconds(bucket_size)?;
        if range.is_empty() {
            return Err(CostError::invalid_parameter("range", range));
        }
        Ok(build_series(records, &dims, bucket_secs, range))
    }
}

fn bucket_seconds(bucket_size: Duration) -> Result<i64> {
    let secs = bucket_size.num_seconds();
    if secs <= 0 {
        return Err(CostError::invalid_parameter("bucket_size", format!("{}s", secs)));
    }
    Ok(secs)
}

fn floor_to_bucket(ts: DateTime<Utc>, bucket_secs: i64) -> i64 {
    ts.timestamp().div_euclid(bucket_secs) * bucket_secs
}

fn dimension_key(record: &CostRecord, dims: &[Dimension]) -> String {
    let parts: Vec<String> = dims
        .iter()
        .filter_map(|d| d.value_of(record).map(|v| format!("{}={}", d, v)))
        .collect();
    if parts.is_empty() { TOTAL_KEY.to_string() } else { parts.join(",") }
}

fn build_series(
    records: &[CostRecord],
    dims: &[Dimension],
    bucket_secs: i64,
    range: &TimeRange,
) -> Vec<CostSeries> {
    let first = floor_to_bucket(range.start, bucket_secs);
    let last = floor_to_bucket(range.end - Duration::nanoseconds(1), bucket_secs);
    let slots = ((last - first) / bucket_secs + 1) as usize;

    let grid = |_: &String| -> Vec<CostBucket> {
        (0..slots)
            .map(|i| {
                let secs = first + i as i64 * bucket_secs;
                CostBucket::empty(DateTime::from_timestamp(secs, 0).unwrap_or(range.start))
            })
            .collect()
    };

    let mut grouped: BTreeMap<String, Vec<CostBucket>> = BTreeMap::new();
    let grouping = dims.iter().any(|d| *d != Dimension::Date);
    if !grouping {
        let key = TOTAL_KEY.to_string();
        let buckets = grid(&key);
        grouped.insert(key, buckets);
    }

    for record in records.iter().filter(|r| range.contains(r.timestamp)) {
        let key = dimension_key(record, dims);
        let slot = ((floor_to_bucket(record.timestamp, bucket_secs) - first) / bucket_secs) as usize;
        let buckets = grouped.entry(key).or_insert_with_key(|k| grid(k));
        if let Some(bucket) = buckets.get_mut(slot) {
            bucket.total_cost_usd += record.cost_usd;
            bucket.record_count += 1;
            bucket.bytes_processed += record.bytes_processed;
        }
    }

    grouped
        .into_iter()
        .map(|(dimension_key, buckets)| CostSeries { dimension_key, buckets })
        .collect()
}
