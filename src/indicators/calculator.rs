use crate::indicators::oscillators::OscillatorCalculator;
use crate::indicators::overlaps::OverlapCalculator;
use crate::indicators::spec::IndicatorSpec;
use crate::models::{Bar, IndicatorSeries, PriceField};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Indicator family an id resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorMethod {
    Sma,
    Ema,
    Rsi,
    Macd,
    Bollinger,
    Kdj,
}

impl IndicatorMethod {
    /// Resolve an indicator id by its method prefix (`sma20` → SMA, `bollinger` → Bollinger).
    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_lowercase();
        let stem = id.trim_end_matches(|c: char| c.is_ascii_digit() || c == '_' || c == '-');
        match stem {
            "sma" | "ma" => Some(IndicatorMethod::Sma),
            "ema" => Some(IndicatorMethod::Ema),
            "rsi" => Some(IndicatorMethod::Rsi),
            "macd" => Some(IndicatorMethod::Macd),
            "bollinger" | "boll" | "bbands" => Some(IndicatorMethod::Bollinger),
            "kdj" => Some(IndicatorMethod::Kdj),
            _ => None,
        }
    }
}

impl fmt::Display for IndicatorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorMethod::Sma => write!(f, "SMA"),
            IndicatorMethod::Ema => write!(f, "EMA"),
            IndicatorMethod::Rsi => write!(f, "RSI"),
            IndicatorMethod::Macd => write!(f, "MACD"),
            IndicatorMethod::Bollinger => write!(f, "BOLL"),
            IndicatorMethod::Kdj => write!(f, "KDJ"),
        }
    }
}

/// A fully parameterized indicator ready to run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorKind {
    Sma { period: usize, source: PriceField },
    Ema { period: usize, source: PriceField },
    Rsi { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    Bollinger { period: usize, multiplier: f64 },
    Kdj { k_period: usize, d_period: usize, j_period: usize },
}

impl IndicatorKind {
    /// Build from a spec, falling back to the conventional defaults for missing parameters.
    pub fn from_spec(spec: &IndicatorSpec) -> Result<Self, String> {
        let method = IndicatorMethod::from_id(&spec.id)
            .ok_or_else(|| format!("unknown indicator id '{}'", spec.id))?;

        let period = |name: &str, default: usize| -> Result<usize, String> {
            match spec.parameters.get(name) {
                None => Ok(default),
                Some(_) => spec
                    .period(name)
                    .ok_or_else(|| format!("{} parameter '{}' is not a whole number", spec.id, name)),
            }
        };

        let kind = match method {
            IndicatorMethod::Sma => IndicatorKind::Sma {
                period: period("period", 20)?,
                source: spec.source_field,
            },
            IndicatorMethod::Ema => IndicatorKind::Ema {
                period: period("period", 12)?,
                source: spec.source_field,
            },
            IndicatorMethod::Rsi => IndicatorKind::Rsi { period: period("period", 14)? },
            IndicatorMethod::Macd => IndicatorKind::Macd {
                fast: period("fastPeriod", 12)?,
                slow: period("slowPeriod", 26)?,
                signal: period("signalPeriod", 9)?,
            },
            IndicatorMethod::Bollinger => IndicatorKind::Bollinger {
                period: period("period", 20)?,
                multiplier: spec.number("stdDev").unwrap_or(2.0),
            },
            IndicatorMethod::Kdj => IndicatorKind::Kdj {
                k_period: period("kPeriod", 9)?,
                d_period: period("dPeriod", 3)?,
                j_period: period("jPeriod", 3)?,
            },
        };
        Ok(kind)
    }

    pub fn method(&self) -> IndicatorMethod {
        match self {
            IndicatorKind::Sma { .. } => IndicatorMethod::Sma,
            IndicatorKind::Ema { .. } => IndicatorMethod::Ema,
            IndicatorKind::Rsi { .. } => IndicatorMethod::Rsi,
            IndicatorKind::Macd { .. } => IndicatorMethod::Macd,
            IndicatorKind::Bollinger { .. } => IndicatorMethod::Bollinger,
            IndicatorKind::Kdj { .. } => IndicatorMethod::Kdj,
        }
    }

    /// Number of leading bars that produce no output.
    pub fn warmup(&self) -> usize {
        match *self {
            IndicatorKind::Sma { period, .. }
            | IndicatorKind::Ema { period, .. }
            | IndicatorKind::Bollinger { period, .. } => period.saturating_sub(1),
            IndicatorKind::Rsi { period } => period,
            IndicatorKind::Macd { fast, slow, signal } => {
                fast.max(slow).saturating_sub(1) + signal.saturating_sub(1)
            }
            IndicatorKind::Kdj { k_period, .. } => k_period.saturating_sub(1),
        }
    }

    pub fn compute(&self, bars: &[Bar]) -> IndicatorSeries {
        match *self {
            IndicatorKind::Sma { period, source } => OverlapCalculator::calculate_sma(bars, period, source),
            IndicatorKind::Ema { period, source } => OverlapCalculator::calculate_ema(bars, period, source),
            IndicatorKind::Rsi { period } => OscillatorCalculator::calculate_rsi(bars, period),
            IndicatorKind::Macd { fast, slow, signal } => {
                OscillatorCalculator::calculate_macd(bars, fast, slow, signal)
            }
            IndicatorKind::Bollinger { period, multiplier } => {
                OverlapCalculator::calculate_bollinger_bands(bars, period, multiplier)
            }
            IndicatorKind::Kdj { k_period, d_period, j_period } => {
                OscillatorCalculator::calculate_kdj(bars, k_period, d_period, j_period)
            }
        }
    }
}

pub struct IndicatorCalculator;

impl IndicatorCalculator {
    /// Run one indicator. Specs that do not resolve yield an empty series and a warning.
    pub fn calculate(bars: &[Bar], spec: &IndicatorSpec) -> IndicatorSeries {
        match IndicatorKind::from_spec(spec) {
            Ok(kind) => {
                let series = kind.compute(bars);
                if series.is_empty() && !bars.is_empty() {
                    debug!(
                        indicator = %spec.id,
                        bars = bars.len(),
                        warmup = kind.warmup(),
                        "Not enough history for indicator"
                    );
                }
                series
            }
            Err(e) => {
                warn!(indicator = %spec.id, error = %e, "Unsupported indicator");
                Vec::new()
            }
        }
    }

    /// Run every spec, keyed by spec id.
    pub fn calculate_all(bars: &[Bar], specs: &[IndicatorSpec]) -> BTreeMap<String, IndicatorSeries> {
        specs
            .iter()
            .map(|spec| (spec.id.clone(), Self::calculate(bars, spec)))
            .collect()
    }
}
