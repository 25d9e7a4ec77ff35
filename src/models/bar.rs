use crate::error::BarError;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// One daily (or aggregated) OHLCV record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub time: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_change: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_change_percent: Option<f64>,
}

impl Bar {
    pub fn new(time: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            amount: None,
            price_change: None,
            price_change_percent: None,
        }
    }

    /// Check the OHLC invariants. Optional fields only need to be finite when present.
    pub fn validate(&self) -> Result<(), BarError> {
        let required = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ];
        let optional = [
            ("amount", self.amount),
            ("priceChange", self.price_change),
            ("priceChangePercent", self.price_change_percent),
        ];

        for (field, value) in required {
            if !value.is_finite() {
                return Err(BarError::NonFinite { time: self.time, field });
            }
        }
        for (field, value) in optional {
            if matches!(value, Some(v) if !v.is_finite()) {
                return Err(BarError::NonFinite { time: self.time, field });
            }
        }

        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(BarError::NonPositivePrice { time: self.time });
        }
        if self.volume < 0.0 {
            return Err(BarError::NegativeVolume { time: self.time, volume: self.volume });
        }
        if self.high < self.open.max(self.close) {
            return Err(BarError::HighBelowBody { time: self.time, high: self.high });
        }
        if self.low > self.open.min(self.close) {
            return Err(BarError::LowAboveBody { time: self.time, low: self.low });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn field(&self, field: PriceField) -> f64 {
        match field {
            PriceField::Open => self.open,
            PriceField::High => self.high,
            PriceField::Low => self.low,
            PriceField::Close => self.close,
            PriceField::Volume => self.volume,
        }
    }
}

/// Which bar column an indicator reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    Open,
    High,
    Low,
    #[default]
    Close,
    Volume,
}

impl fmt::Display for PriceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceField::Open => write!(f, "open"),
            PriceField::High => write!(f, "high"),
            PriceField::Low => write!(f, "low"),
            PriceField::Close => write!(f, "close"),
            PriceField::Volume => write!(f, "volume"),
        }
    }
}

impl FromStr for PriceField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(PriceField::Open),
            "high" => Ok(PriceField::High),
            "low" => Ok(PriceField::Low),
            "close" => Ok(PriceField::Close),
            "volume" => Ok(PriceField::Volume),
            other => Err(format!("unknown source field: {}", other)),
        }
    }
}

/// A numeric field as the bar source sends it: a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Number(f64),
    Text(String),
}

impl RawNumber {
    pub fn parse(&self) -> Option<f64> {
        match self {
            RawNumber::Number(n) => Some(*n),
            RawNumber::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }
}

/// A bar record as returned by the bar-source collaborator or pushed by the live feed.
///
/// Accepts both the bar field names and the upstream daily-kline names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBarRecord {
    #[serde(alias = "tradingDate", alias = "trading_date")]
    pub time: String,
    #[serde(alias = "openingPrice", alias = "opening_price")]
    pub open: RawNumber,
    #[serde(alias = "highestPrice", alias = "highest_price")]
    pub high: RawNumber,
    #[serde(alias = "lowestPrice", alias = "lowest_price")]
    pub low: RawNumber,
    #[serde(alias = "closingPrice", alias = "closing_price")]
    pub close: RawNumber,
    #[serde(default, alias = "tradingVolume", alias = "trading_volume")]
    pub volume: Option<RawNumber>,
    #[serde(default, alias = "tradingAmount", alias = "trading_amount")]
    pub amount: Option<RawNumber>,
    #[serde(default, alias = "price_change")]
    pub price_change: Option<RawNumber>,
    #[serde(default, alias = "priceChangePercentage", alias = "price_change_percentage")]
    pub price_change_percent: Option<RawNumber>,
}

impl RawBarRecord {
    /// Decode into a validated bar.
    pub fn to_bar(&self, index: usize) -> Result<Bar, BarError> {
        let time = parse_date(&self.time).ok_or_else(|| BarError::Unparseable {
            index,
            reason: format!("bad date '{}'", self.time),
        })?;

        let required = |name: &str, raw: &RawNumber| {
            raw.parse().ok_or_else(|| BarError::Unparseable {
                index,
                reason: format!("bad {} value {:?}", name, raw),
            })
        };
        // Absent or unparseable optional numerics are dropped, as the upstream sends nulls freely.
        let optional = |raw: &Option<RawNumber>| raw.as_ref().and_then(RawNumber::parse);

        let bar = Bar {
            time,
            open: required("open", &self.open)?,
            high: required("high", &self.high)?,
            low: required("low", &self.low)?,
            close: required("close", &self.close)?,
            volume: optional(&self.volume).unwrap_or(0.0),
            amount: optional(&self.amount),
            price_change: optional(&self.price_change),
            price_change_percent: optional(&self.price_change_percent),
        };

        bar.validate()?;
        Ok(bar)
    }
}

/// Accepts `YYYY-MM-DD` and RFC 3339 timestamps (date part taken as-is).
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    s.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// Turn raw records into an ascending, duplicate-free bar sequence.
///
/// Malformed records are excluded and returned alongside the clean bars. When two
/// records share a date the one appearing later in the input wins.
pub fn normalize_records(records: &[RawBarRecord]) -> (Vec<Bar>, Vec<BarError>) {
    let mut bars = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();

    for (index, record) in records.iter().enumerate() {
        match record.to_bar(index) {
            Ok(bar) => bars.push(bar),
            Err(e) => {
                warn!(error = %e, "Excluding malformed bar record");
                rejected.push(e);
            }
        }
    }

    // Stable sort keeps input order among equal dates, so the last one is the newest.
    bars.sort_by_key(|b| b.time);
    let before = bars.len();
    let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match deduped.last_mut() {
            Some(last) if last.time == bar.time => *last = bar,
            _ => deduped.push(bar),
        }
    }
    if deduped.len() != before {
        warn!(dropped = before - deduped.len(), "Dropped duplicate bar dates");
    }

    (deduped, rejected)
}

/// True when times are strictly increasing.
pub fn is_strictly_ascending(bars: &[Bar]) -> bool {
    bars.windows(2).all(|w| w[0].time < w[1].time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_validate_rejects_inverted_high() {
        let bar = Bar::new(date("2024-01-02"), 10.0, 9.5, 9.0, 9.8, 100.0);
        assert!(matches!(bar.validate(), Err(BarError::HighBelowBody { .. })));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let bar = Bar::new(date("2024-01-02"), 10.0, f64::NAN, 9.0, 9.8, 100.0);
        assert!(matches!(bar.validate(), Err(BarError::NonFinite { field: "high", .. })));
    }

    #[test]
    fn test_raw_record_with_string_numerics() {
        let record: RawBarRecord = serde_json::from_value(json!({
            "tradingDate": "2024-03-01T00:00:00.000Z",
            "openingPrice": "10.10",
            "highestPrice": "10.50",
            "lowestPrice": "10.00",
            "closingPrice": "10.40",
            "tradingVolume": "12000",
            "tradingAmount": "125000.5",
            "priceChange": null,
            "priceChangePercentage": "1.2"
        }))
        .unwrap();

        let bar = record.to_bar(0).unwrap();
        assert_eq!(bar.time, date("2024-03-01"));
        assert_eq!(bar.open, 10.10);
        assert_eq!(bar.volume, 12000.0);
        assert_eq!(bar.amount, Some(125000.5));
        assert_eq!(bar.price_change, None);
        assert_eq!(bar.price_change_percent, Some(1.2));
    }

    #[test]
    fn test_normalize_sorts_dedups_and_drops_bad_rows() {
        let records: Vec<RawBarRecord> = serde_json::from_value(json!([
            {"time": "2024-01-03", "open": 11, "high": 12, "low": 10, "close": 11.5, "volume": 1},
            {"time": "2024-01-02", "open": 10, "high": 11, "low": 9, "close": 10.5, "volume": 1},
            {"time": "2024-01-03", "open": 11, "high": 13, "low": 10, "close": 12.5, "volume": 2},
            {"time": "2024-01-04", "open": 11, "high": 10, "low": 9, "close": 10.5, "volume": 1},
            {"time": "not-a-date", "open": 11, "high": 12, "low": 10, "close": 11.5}
        ]))
        .unwrap();

        let (bars, rejected) = normalize_records(&records);
        assert_eq!(bars.len(), 2);
        assert_eq!(rejected.len(), 2);
        assert!(is_strictly_ascending(&bars));
        assert_eq!(bars[1].close, 12.5);
    }
}
