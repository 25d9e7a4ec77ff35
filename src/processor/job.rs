use crate::aggregator::Period;
use crate::cache::{CacheKeys, CachePayload};
use crate::indicators::IndicatorSpec;
use crate::models::bar::is_strictly_ascending;
use crate::models::{Bar, IndicatorSeries};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn is_empty_range(&self) -> bool {
        matches!((self.start, self.end), (Some(s), Some(e)) if s > e)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// One request for aggregated bars plus indicators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub instrument: String,
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub date_range: DateRange,
    #[serde(default)]
    pub indicators: Vec<IndicatorSpec>,
}

impl QueryRequest {
    pub fn new(instrument: impl Into<String>, period: Period) -> Self {
        Self {
            instrument: instrument.into(),
            period,
            date_range: DateRange::default(),
            indicators: Vec::new(),
        }
    }

    pub fn with_range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.date_range = DateRange::new(start, end);
        self
    }

    pub fn with_indicator(mut self, spec: IndicatorSpec) -> Self {
        self.indicators.push(spec);
        self
    }

    pub fn cache_key(&self) -> String {
        CacheKeys::query_key(
            &self.instrument,
            self.period,
            self.date_range.start.as_ref(),
            self.date_range.end.as_ref(),
            &self.indicators,
        )
    }
}

/// Aggregated bars and their indicator series, as cached and handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub instrument: String,
    pub period: Period,
    pub bars: Vec<Bar>,
    pub indicators: BTreeMap<String, IndicatorSeries>,
}

impl QueryResult {
    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn series(&self, id: &str) -> Option<&IndicatorSeries> {
        self.indicators.get(id)
    }
}

impl CachePayload for QueryResult {
    /// Bars strictly ascending; every indicator point ascending and on a bar time.
    fn is_well_formed(&self) -> bool {
        if !is_strictly_ascending(&self.bars) {
            return false;
        }
        let times: HashSet<NaiveDate> = self.bars.iter().map(|b| b.time).collect();
        self.indicators.values().all(|series| {
            series.windows(2).all(|w| w[0].time < w[1].time)
                && series.iter().all(|p| times.contains(&p.time) && p.value.is_finite())
        })
    }
}
