use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value emitted by an indicator at one bar time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    Macd { macd: f64, signal: f64, histogram: f64 },
    Bands { upper: f64, middle: f64, lower: f64 },
    Kdj { k: f64, d: f64, j: f64 },
    Single(f64),
}

impl IndicatorValue {
    pub fn as_single(&self) -> Option<f64> {
        match self {
            IndicatorValue::Single(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        match *self {
            IndicatorValue::Single(v) => v.is_finite(),
            IndicatorValue::Macd { macd, signal, histogram } => {
                macd.is_finite() && signal.is_finite() && histogram.is_finite()
            }
            IndicatorValue::Bands { upper, middle, lower } => {
                upper.is_finite() && middle.is_finite() && lower.is_finite()
            }
            IndicatorValue::Kdj { k, d, j } => k.is_finite() && d.is_finite() && j.is_finite(),
        }
    }
}

impl fmt::Display for IndicatorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IndicatorValue::Single(v) => write!(f, "{:.4}", v),
            IndicatorValue::Macd { macd, signal, histogram } => {
                write!(f, "macd={:.4} signal={:.4} hist={:.4}", macd, signal, histogram)
            }
            IndicatorValue::Bands { upper, middle, lower } => {
                write!(f, "upper={:.4} middle={:.4} lower={:.4}", upper, middle, lower)
            }
            IndicatorValue::Kdj { k, d, j } => write!(f, "k={:.2} d={:.2} j={:.2}", k, d, j),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub time: NaiveDate,
    pub value: IndicatorValue,
}

impl IndicatorPoint {
    pub fn single(time: NaiveDate, value: f64) -> Self {
        Self { time, value: IndicatorValue::Single(value) }
    }
}

pub type IndicatorSeries = Vec<IndicatorPoint>;

