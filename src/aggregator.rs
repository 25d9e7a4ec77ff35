use crate::models::Bar;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Calendar period a bar sequence is bucketed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[default]
    Day,
    Week,
    Month,
}

impl Period {
    pub fn label(&self) -> &'static str {
        match self {
            Period::Day => "Daily",
            Period::Week => "Weekly",
            Period::Month => "Monthly",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Day => write!(f, "day"),
            Period::Week => write!(f, "week"),
            Period::Month => write!(f, "month"),
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // "1M" is month, "1m" would be ambiguous with minutes so only the upper case form is taken
        if s == "1M" {
            return Ok(Period::Month);
        }
        match s.to_lowercase().as_str() {
            "day" | "d" | "1d" | "daily" => Ok(Period::Day),
            "week" | "w" | "1w" | "weekly" => Ok(Period::Week),
            "month" | "m" | "monthly" => Ok(Period::Month),
            other => Err(format!("unknown period: {}", other)),
        }
    }
}

/// Identifies the calendar bucket a date falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketKey {
    Day(NaiveDate),
    /// Monday starting the ISO week.
    Week(NaiveDate),
    Month(i32, u32),
}

fn bucket_key(date: NaiveDate, period: Period) -> BucketKey {
    match period {
        Period::Day => BucketKey::Day(date),
        Period::Week => {
            let back = date.weekday().num_days_from_monday() as i64;
            BucketKey::Week(date - Duration::days(back))
        }
        Period::Month => BucketKey::Month(date.year(), date.month()),
    }
}

pub struct Aggregator;

impl Aggregator {
    /// Re-bucket an ascending daily sequence into `period` bars.
    ///
    /// Malformed bars are skipped with a warning. The trailing bucket is emitted even
    /// when it is incomplete.
    pub fn aggregate(bars: &[Bar], period: Period) -> Vec<Bar> {
        let valid: Vec<&Bar> = bars
            .iter()
            .filter(|bar| match bar.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed bar during aggregation");
                    false
                }
            })
            .collect();

        if period == Period::Day {
            return valid.into_iter().cloned().collect();
        }

        let mut out = Vec::new();
        let mut bucket: Vec<&Bar> = Vec::new();
        let mut current: Option<BucketKey> = None;

        for bar in valid {
            let key = bucket_key(bar.time, period);
            if current != Some(key) && !bucket.is_empty() {
                out.push(Self::merge(&bucket));
                bucket.clear();
            }
            current = Some(key);
            bucket.push(bar);
        }
        if !bucket.is_empty() {
            out.push(Self::merge(&bucket));
        }

        debug!(input = bars.len(), output = out.len(), period = %period, "Aggregated bars");
        out
    }

    pub fn weekly(bars: &[Bar]) -> Vec<Bar> {
        Self::aggregate(bars, Period::Week)
    }

    pub fn monthly(bars: &[Bar]) -> Vec<Bar> {
        Self::aggregate(bars, Period::Month)
    }

    /// Merge one bucket. Callers never pass an empty slice.
    fn merge(bucket: &[&Bar]) -> Bar {
        let first = bucket[0];
        if bucket.len() == 1 {
            return first.clone();
        }
        let last = bucket[bucket.len() - 1];

        let high = bucket.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let low = bucket.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let volume = bucket.iter().map(|b| b.volume).sum();
        let amount = bucket
            .iter()
            .filter_map(|b| b.amount)
            .fold(None, |acc: Option<f64>, a| Some(acc.unwrap_or(0.0) + a));
        let change = last.close - first.open;

        Bar {
            time: last.time,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
            amount,
            price_change: Some(change),
            price_change_percent: Some(change / first.open * 100.0),
        }
    }
}
