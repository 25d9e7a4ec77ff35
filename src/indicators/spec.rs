use crate::models::PriceField;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorCategory {
    #[default]
    Overlay,
    Oscillator,
}

impl fmt::Display for IndicatorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorCategory::Overlay => write!(f, "overlay"),
            IndicatorCategory::Oscillator => write!(f, "oscillator"),
        }
    }
}

/// A parameter setting: numeric or enumerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            ParamValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

/// Request for one indicator series.
///
/// Parameters live in a `BTreeMap` so two specs with the same settings serialize to
/// the same text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorSpec {
    pub id: String,
    #[serde(default)]
    pub category: IndicatorCategory,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub source_field: PriceField,
}

impl IndicatorSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: IndicatorCategory::default(),
            parameters: BTreeMap::new(),
            source_field: PriceField::default(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn with_source(mut self, source: PriceField) -> Self {
        self.source_field = source;
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).and_then(ParamValue::as_f64)
    }

    /// A period-like parameter. Fractional or negative values are rejected as `None`.
    pub fn period(&self, name: &str) -> Option<usize> {
        self.number(name)
            .filter(|n| n.is_finite() && *n >= 0.0 && n.fract() == 0.0)
            .map(|n| n as usize)
    }

    /// Stable text form used in cache keys.
    pub fn fingerprint(&self) -> String {
        let params = self
            .parameters
            .iter()
            .map(|(k, v)| match v {
                ParamValue::Number(n) => format!("{}={}", k, n),
                ParamValue::Text(s) => format!("{}={}", k, s),
            })
            .collect::<Vec<_>>()
            .join(",");
        format!("{}[{}]@{}", self.id.to_lowercase(), params, self.source_field)
    }
}

/// Parses the CLI form `id` or `id:name=value,name=value`.
impl FromStr for IndicatorSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, rest) = match s.split_once(':') {
            Some((id, rest)) => (id.trim(), Some(rest)),
            None => (s.trim(), None),
        };
        if id.is_empty() {
            return Err("indicator id is empty".to_string());
        }

        let mut spec = IndicatorSpec::new(id);
        for pair in rest.into_iter().flat_map(|r| r.split(',')).filter(|p| !p.trim().is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected name=value, got '{}'", pair))?;
            let (name, value) = (name.trim(), value.trim());
            if name == "source" {
                spec.source_field = value.parse()?;
                continue;
            }
            let value = match value.parse::<f64>() {
                Ok(n) => ParamValue::Number(n),
                Err(_) => ParamValue::Text(value.to_string()),
            };
            spec.parameters.insert(name.to_string(), value);
        }
        Ok(spec)
    }
}
