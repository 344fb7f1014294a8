//! Pre-aggregation definitions, time ranges and partitions

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Timelike,
    Utc,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::cache::RefreshKeySpec;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::store::VersionEntry;

/// Parameter replaced by the inclusive start of a partition's range
pub const FROM_PARTITION_RANGE: &str = "__FROM_PARTITION_RANGE";
/// Parameter replaced by the exclusive end of a partition's range
pub const TO_PARTITION_RANGE: &str = "__TO_PARTITION_RANGE";

/// Timestamp format of range parameters
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Partition size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Start of the unit containing `ts`. Weeks start on Monday.
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        match self {
            Granularity::Hour => midnight(date) + ChronoDuration::hours(ts.hour() as i64),
            Granularity::Day => midnight(date),
            Granularity::Week => {
                midnight(date) - ChronoDuration::days(date.weekday().num_days_from_monday() as i64)
            }
            Granularity::Month => midnight(first_of_month(date.year(), date.month())),
            Granularity::Quarter => {
                let month = (date.month() - 1) / 3 * 3 + 1;
                midnight(first_of_month(date.year(), month))
            }
            Granularity::Year => midnight(first_of_month(date.year(), 1)),
        }
    }

    /// Start of the unit following the one starting at `start`
    pub fn next(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Hour => start + ChronoDuration::hours(1),
            Granularity::Day => start + ChronoDuration::days(1),
            Granularity::Week => start + ChronoDuration::days(7),
            Granularity::Month => add_months(start, 1),
            Granularity::Quarter => add_months(start, 3),
            Granularity::Year => add_months(start, 12),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            "year" => Ok(Granularity::Year),
            other => Err(OrchestratorError::InvalidRequest(format!(
                "Unknown granularity: {}",
                other
            ))),
        }
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default()
}

/// `start` must be the first day of a month at midnight
fn add_months(start: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let index = start.year() * 12 + start.month0() as i32 + months as i32;
    midnight(first_of_month(index.div_euclid(12), index.rem_euclid(12) as u32 + 1))
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> OrchestratorResult<Self> {
        if end <= start {
            return Err(OrchestratorError::BuildRange(format!(
                "Empty range: {} .. {}",
                format_timestamp(start),
                format_timestamp(end)
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse both bounds with [`parse_timestamp`]
    pub fn parse(start: &str, end: &str) -> OrchestratorResult<Self> {
        let parse = |s: &str| {
            parse_timestamp(s).ok_or_else(|| {
                OrchestratorError::InvalidRequest(format!("Invalid timestamp: {}", s))
            })
        };
        Self::new(parse(start)?, parse(end)?)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(DateRange { start, end })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse RFC 3339, `YYYY-MM-DD[ T]HH:MM:SS[.fff]` or `YYYY-MM-DD`, as UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&ts));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(midnight)
}

/// Timestamp from a query result value: a string, or epoch seconds/milliseconds
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let n = n.as_i64()?;
            if n.abs() > 100_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

/// Where the total build range of a pre-aggregation comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildRangeSource {
    Explicit { start: String, end: String },
    /// Driven min/max queries against the source. The max is inclusive.
    Query { start_sql: String, end_sql: String },
}

/// A partitioned materialized view over a time dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreAggregationDefinition {
    pub name: String,
    /// Logical table name; partitions append a date suffix
    pub table_name: String,
    /// Data source the partition SQL runs on
    pub data_source: String,
    /// Data source holding the built tables, if not the source itself
    #[serde(default)]
    pub external_data_source: Option<String>,
    /// Partition SQL. Parameters equal to [`FROM_PARTITION_RANGE`] and
    /// [`TO_PARTITION_RANGE`] are bound to each partition's range.
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub time_dimension: String,
    pub granularity: Granularity,
    pub build_range: BuildRangeSource,
    #[serde(default)]
    pub refresh_key: RefreshKeySpec,
    /// Closed partitions ending within this window of the build range end
    /// keep refreshing
    #[serde(default)]
    pub update_window_secs: Option<u64>,
    /// Answer lambda reads with built partitions plus a live source query
    #[serde(default)]
    pub union_with_source_data: bool,
    #[serde(default)]
    pub priority: i32,
}

impl PreAggregationDefinition {
    /// Data source holding the built tables
    pub fn storage_data_source(&self) -> &str {
        self.external_data_source
            .as_deref()
            .unwrap_or(&self.data_source)
    }

    /// `params` with the range placeholders bound
    pub fn params_for(&self, range: &DateRange) -> Vec<Value> {
        bind_range(&self.params, range)
    }
}

/// Replace range placeholders in `params`
pub fn bind_range(params: &[Value], range: &DateRange) -> Vec<Value> {
    params
        .iter()
        .map(|param| match param.as_str() {
            Some(FROM_PARTITION_RANGE) => Value::String(format_timestamp(range.start)),
            Some(TO_PARTITION_RANGE) => Value::String(format_timestamp(range.end)),
            _ => param.clone(),
        })
        .collect()
}

/// One independently buildable slice of a pre-aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Name of the owning definition
    pub pre_aggregation: String,
    pub table_name: String,
    pub range: DateRange,
    /// End of the data a build of this partition can contain: the range end,
    /// or the build range end when that comes first
    pub build_range_end: DateTime<Utc>,
    pub granularity: Granularity,
    pub refresh_key: RefreshKeySpec,
    pub data_source: String,
    pub storage_data_source: String,
    pub sql: String,
    pub params: Vec<Value>,
    pub priority: i32,
    /// Latest build sharing the current structure version
    #[serde(default)]
    pub version_entry: Option<VersionEntry>,
}

impl Partition {
    pub fn is_built(&self) -> bool {
        self.version_entry.is_some()
    }

    /// Physical table of the latest build
    pub fn target_table(&self) -> Option<String> {
        self.version_entry.as_ref().map(|e| e.target_table_name())
    }
}

/// Two pre-aggregations joined on shared dimensions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupJoinDefinition {
    pub name: String,
    pub left: String,
    pub right: String,
    /// Join dimension columns present on both sides
    pub on: Vec<String>,
}
