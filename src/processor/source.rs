use crate::config::{QueryConfig, SortDirection};
use crate::error::FetchError;
use crate::models::bar::parse_date;
use crate::models::RawBarRecord;
use crate::processor::job::DateRange;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

/// What the bar-source collaborator is asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarQuery {
    pub instrument_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    pub page_size: Option<u32>,
    pub sort_field: Option<String>,
    pub sort_direction: Option<SortDirection>,
}

impl BarQuery {
    pub fn new(instrument: &str, range: &DateRange, config: &QueryConfig) -> Self {
        Self {
            instrument_code: instrument.to_string(),
            start_date: range.start.as_ref().map(crate::utils::format_date),
            end_date: range.end.as_ref().map(crate::utils::format_date),
            page_size: Some(config.page_size),
            sort_field: Some(config.sort_field.clone()),
            sort_direction: Some(config.sort_direction),
        }
    }

    pub fn date_range(&self) -> DateRange {
        DateRange::new(
            self.start_date.as_deref().and_then(parse_date),
            self.end_date.as_deref().and_then(parse_date),
        )
    }
}

/// External source of raw daily bars.
#[async_trait]
pub trait BarSource: Send + Sync {
    async fn fetch_bars(&self, query: &BarQuery) -> Result<Vec<RawBarRecord>, FetchError>;
}

/// Reads raw bar records from a JSON file: either a bare array or an object
/// with the array under `data` or `records`.
#[derive(Debug, Clone)]
pub struct JsonFileBarSource {
    path: PathBuf,
}

impl JsonFileBarSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn decode(text: &str) -> Result<Vec<RawBarRecord>, FetchError> {
        let value: Value = serde_json::from_str(text).map_err(|e| FetchError::Decode(e.to_string()))?;
        let list = match value {
            Value::Array(_) => value,
            Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("records")) {
                Some(list @ Value::Array(_)) => list,
                _ => return Err(FetchError::Decode("expected an array of bar records".to_string())),
            },
            _ => return Err(FetchError::Decode("expected an array of bar records".to_string())),
        };
        serde_json::from_value(list).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BarSource for JsonFileBarSource {
    async fn fetch_bars(&self, query: &BarQuery) -> Result<Vec<RawBarRecord>, FetchError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| FetchError::Upstream(format!("{}: {}", self.path.display(), e)))?;
        let records = Self::decode(&text)?;

        // Undated records pass through so normalization can report them.
        let range = query.date_range();
        let total = records.len();
        let mut records: Vec<RawBarRecord> = records
            .into_iter()
            .filter(|r| parse_date(&r.time).map_or(true, |d| range.contains(d)))
            .collect();
        if query.sort_direction == Some(SortDirection::Desc) {
            records.reverse();
        }
        if let Some(limit) = query.page_size {
            records.truncate(limit as usize);
        }

        debug!(
            path = %self.path.display(),
            total,
            returned = records.len(),
            "Read bar records from file"
        );
        Ok(records)
    }
}
