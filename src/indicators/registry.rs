use crate::error::QueryError;
use crate::indicators::calculator::{IndicatorKind, IndicatorMethod};
use crate::indicators::spec::{IndicatorCategory, IndicatorSpec, ParamValue};
use crate::models::PriceField;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Named, pre-parameterized indicator offered to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub method: IndicatorMethod,
    pub category: IndicatorCategory,
    pub color: &'static str,
    pub line_width: u8,
    pub source: PriceField,
    pub defaults: Vec<(&'static str, f64)>,
}

impl IndicatorTemplate {
    /// Parameter names the template's method understands.
    pub fn known_parameters(&self) -> &'static [&'static str] {
        match self.method {
            IndicatorMethod::Sma | IndicatorMethod::Ema => &["period"],
            IndicatorMethod::Rsi => &["period", "overbought", "oversold"],
            IndicatorMethod::Macd => &["fastPeriod", "slowPeriod", "signalPeriod"],
            IndicatorMethod::Bollinger => &["period", "stdDev"],
            IndicatorMethod::Kdj => &["kPeriod", "dPeriod", "jPeriod"],
        }
    }

    /// A spec pre-filled with this template's defaults.
    pub fn to_spec(&self) -> IndicatorSpec {
        let parameters = self
            .defaults
            .iter()
            .map(|(name, value)| (name.to_string(), ParamValue::Number(*value)))
            .collect::<BTreeMap<_, _>>();
        IndicatorSpec {
            id: self.id.to_string(),
            category: self.category,
            parameters,
            source_field: self.source,
        }
    }
}

/// Result of spec validation containing errors and warnings
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error<S: Into<String>>(&mut self, message: S) {
        self.errors.push(message.into());
    }

    pub fn add_warning<S: Into<String>>(&mut self, message: S) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Fixed table of indicator templates. Carries no computation.
#[derive(Debug, Clone)]
pub struct IndicatorRegistry {
    templates: Vec<IndicatorTemplate>,
}

impl Default for IndicatorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl IndicatorRegistry {
    pub fn builtin() -> Self {
        use IndicatorCategory::{Oscillator, Overlay};
        use IndicatorMethod::*;

        let template = |id, name, method, category, color, line_width, defaults: Vec<(&'static str, f64)>| {
            IndicatorTemplate {
                id,
                name,
                method,
                category,
                color,
                line_width,
                source: PriceField::Close,
                defaults,
            }
        };

        Self {
            templates: vec![
                template("sma5", "SMA(5)", Sma, Overlay, "#FF6B35", 1, vec![("period", 5.0)]),
                template("sma10", "SMA(10)", Sma, Overlay, "#4ECDC4", 1, vec![("period", 10.0)]),
                template("sma20", "SMA(20)", Sma, Overlay, "#45B7D1", 2, vec![("period", 20.0)]),
                template("ema12", "EMA(12)", Ema, Overlay, "#FFA07A", 1, vec![("period", 12.0)]),
                template(
                    "rsi14",
                    "RSI(14)",
                    Rsi,
                    Oscillator,
                    "#FF6B35",
                    1,
                    vec![("period", 14.0), ("overbought", 70.0), ("oversold", 30.0)],
                ),
                template(
                    "macd",
                    "MACD(12,26,9)",
                    Macd,
                    Oscillator,
                    "#4ECDC4",
                    1,
                    vec![("fastPeriod", 12.0), ("slowPeriod", 26.0), ("signalPeriod", 9.0)],
                ),
                template(
                    "bollinger",
                    "BOLL(20,2)",
                    Bollinger,
                    Overlay,
                    "#9B59B6",
                    1,
                    vec![("period", 20.0), ("stdDev", 2.0)],
                ),
                template(
                    "kdj",
                    "KDJ(9,3,3)",
                    Kdj,
                    Oscillator,
                    "#45B7D1",
                    1,
                    vec![("kPeriod", 9.0), ("dPeriod", 3.0), ("jPeriod", 3.0)],
                ),
            ],
        }
    }

    pub fn templates(&self) -> &[IndicatorTemplate] {
        &self.templates
    }

    /// Case-insensitive lookup by exact id.
    pub fn get(&self, id: &str) -> Option<&IndicatorTemplate> {
        let id = id.trim();
        self.templates.iter().find(|t| t.id.eq_ignore_ascii_case(id))
    }

    /// Check a spec against its template without modifying it.
    pub fn validate(&self, spec: &IndicatorSpec) -> ValidationResult {
        let mut result = ValidationResult::new();

        let template = match self.get(&spec.id) {
            Some(t) => t,
            None => {
                result.add_error(format!("Unknown indicator id '{}'", spec.id));
                return result;
            }
        };

        if spec.category != template.category {
            result.add_warning(format!(
                "{}: category {} does not match template category {}",
                spec.id, spec.category, template.category
            ));
        }

        let known = template.known_parameters();
        for (name, value) in &spec.parameters {
            if !known.contains(&name.as_str()) {
                result.add_warning(format!("{}: unknown parameter '{}' is ignored", spec.id, name));
                continue;
            }
            match value.as_f64() {
                None => result.add_error(format!("{}: parameter '{}' is not numeric", spec.id, name)),
                Some(n) if !n.is_finite() => {
                    result.add_error(format!("{}: parameter '{}' is not finite", spec.id, name))
                }
                Some(_) => {}
            }
        }
        if result.has_errors() {
            return result;
        }

        let merged = Self::with_defaults(spec, template);
        match IndicatorKind::from_spec(&merged) {
            Ok(kind) => Self::validate_kind(&spec.id, &kind, &mut result),
            Err(e) => result.add_error(e),
        }

        result
    }

    fn validate_kind(id: &str, kind: &IndicatorKind, result: &mut ValidationResult) {
        let check_period = |result: &mut ValidationResult, name: &str, value: usize| {
            if value == 0 {
                result.add_error(format!("{}: {} must be positive", id, name));
            }
        };

        match *kind {
            IndicatorKind::Sma { period, .. } | IndicatorKind::Ema { period, .. } | IndicatorKind::Rsi { period } => {
                check_period(result, "period", period)
            }
            IndicatorKind::Macd { fast, slow, signal } => {
                check_period(result, "fastPeriod", fast);
                check_period(result, "slowPeriod", slow);
                check_period(result, "signalPeriod", signal);
                if fast >= slow {
                    result.add_error(format!(
                        "{}: fastPeriod ({}) must be less than slowPeriod ({})",
                        id, fast, slow
                    ));
                }
            }
            IndicatorKind::Bollinger { period, multiplier } => {
                check_period(result, "period", period);
                if multiplier <= 0.0 {
                    result.add_error(format!("{}: stdDev must be positive", id));
                }
            }
            IndicatorKind::Kdj { k_period, d_period, j_period } => {
                check_period(result, "kPeriod", k_period);
                check_period(result, "dPeriod", d_period);
                check_period(result, "jPeriod", j_period);
            }
        }
    }

    fn with_defaults(spec: &IndicatorSpec, template: &IndicatorTemplate) -> IndicatorSpec {
        let mut merged = spec.clone();
        for (name, value) in &template.defaults {
            merged
                .parameters
                .entry(name.to_string())
                .or_insert(ParamValue::Number(*value));
        }
        merged
    }

    /// Validate a spec and fill in template defaults.
    ///
    /// Errors reject the indicator; warnings are logged and it proceeds. The
    /// returned spec carries the template's category and every default parameter.
    pub fn resolve(&self, spec: &IndicatorSpec) -> Result<IndicatorSpec, QueryError> {
        let report = self.validate(spec);
        if report.has_errors() {
            return Err(QueryError::Configuration(report.errors.join("; ")));
        }
        for warning in &report.warnings {
            warn!(indicator = %spec.id, "{}", warning);
        }

        // validate() already rejected unknown ids
        let template = self
            .get(&spec.id)
            .ok_or_else(|| QueryError::Configuration(format!("Unknown indicator id '{}'", spec.id)))?;

        let mut resolved = Self::with_defaults(spec, template);
        resolved.id = template.id.to_string();
        resolved.category = template.category;
        debug!(indicator = %resolved.fingerprint(), "Resolved indicator spec");
        Ok(resolved)
    }

    /// Resolve every spec, failing on the first rejected one.
    pub fn resolve_all(&self, specs: &[IndicatorSpec]) -> Result<Vec<IndicatorSpec>, QueryError> {
        specs.iter().map(|spec| self.resolve(spec)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates() {
        let registry = IndicatorRegistry::builtin();
        let ids: Vec<&str> = registry.templates().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["sma5", "sma10", "sma20", "ema12", "rsi14", "macd", "bollinger", "kdj"]);
        assert_eq!(registry.get("SMA20").map(|t| t.line_width), Some(2));
        assert_eq!(registry.get("rsi14").map(|t| t.category), Some(IndicatorCategory::Oscillator));
    }

    #[test]
    fn test_template_default_spec() {
        let registry = IndicatorRegistry::builtin();
        let spec = registry.get("macd").map(IndicatorTemplate::to_spec).unwrap();
        assert_eq!(spec.period("fastPeriod"), Some(12));
        assert_eq!(spec.period("slowPeriod"), Some(26));
        assert_eq!(spec.category, IndicatorCategory::Oscillator);
        assert!(registry.validate(&spec).errors.is_empty());
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let registry = IndicatorRegistry::builtin();
        let err = registry.resolve(&IndicatorSpec::new("unknown_xyz")).unwrap_err();
        assert!(matches!(err, QueryError::Configuration(_)));
    }

    #[test]
    fn test_resolve_fills_defaults_and_category() {
        let registry = IndicatorRegistry::builtin();
        let resolved = registry.resolve(&IndicatorSpec::new("MACD")).unwrap();
        assert_eq!(resolved.id, "macd");
        assert_eq!(resolved.category, IndicatorCategory::Oscillator);
        assert_eq!(resolved.period("fastPeriod"), Some(12));
        assert_eq!(resolved.period("slowPeriod"), Some(26));
        assert_eq!(resolved.period("signalPeriod"), Some(9));
    }

    #[test]
    fn test_overrides_survive_resolution() {
        let registry = IndicatorRegistry::builtin();
        let spec = IndicatorSpec::new("sma20").with_param("period", 30.0);
        assert_eq!(registry.resolve(&spec).unwrap().period("period"), Some(30));
    }

    #[test]
    fn test_invalid_parameters() {
        let registry = IndicatorRegistry::builtin();

        let zero = IndicatorSpec::new("sma5").with_param("period", 0.0);
        assert!(registry.validate(&zero).has_errors());

        let inverted = IndicatorSpec::new("macd")
            .with_param("fastPeriod", 26.0)
            .with_param("slowPeriod", 12.0);
        assert!(registry.validate(&inverted).has_errors());

        let flat_band = IndicatorSpec::new("bollinger").with_param("stdDev", 0.0);
        assert!(registry.validate(&flat_band).has_errors());

        let text = IndicatorSpec::new("kdj").with_param("kPeriod", ParamValue::Text("nine".into()));
        assert!(registry.validate(&text).has_errors());
    }

    #[test]
    fn test_unknown_parameter_only_warns() {
        let registry = IndicatorRegistry::builtin();
        let spec = IndicatorSpec::new("ema12").with_param("smoothing", 3.0);
        let report = registry.validate(&spec);
        assert!(!report.has_errors());
        assert_eq!(report.warnings.len(), 1);
        assert!(registry.resolve(&spec).is_ok());
    }
}
