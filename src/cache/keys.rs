use crate::aggregator::Period;
use crate::indicators::IndicatorSpec;
use crate::utils::format_date;
use chrono::NaiveDate;

pub struct CacheKeys;

impl CacheKeys {
    // Prefix shared by every query result for one instrument
    pub fn instrument_prefix(instrument: &str) -> String {
        format!("query:{}:", instrument.trim().to_uppercase())
    }

    // Cache key for an aggregated bar set plus its indicators
    pub fn query_key(
        instrument: &str,
        period: Period,
        start: Option<&NaiveDate>,
        end: Option<&NaiveDate>,
        indicators: &[IndicatorSpec],
    ) -> String {
        let bound = |d: Option<&NaiveDate>| d.map(format_date).unwrap_or_else(|| "*".to_string());

        // Result series are keyed by id, so request order must not change the key.
        let mut fingerprints: Vec<String> = indicators.iter().map(IndicatorSpec::fingerprint).collect();
        fingerprints.sort();
        fingerprints.dedup();

        format!(
            "{}{}:{}:{}:{}",
            Self::instrument_prefix(instrument),
            period,
            bound(start),
            bound(end),
            fingerprints.join("|")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_key_is_order_independent() {
        let sma = IndicatorSpec::new("sma5").with_param("period", 5.0);
        let rsi = IndicatorSpec::new("rsi14").with_param("period", 14.0);
        let a = CacheKeys::query_key("600519", Period::Week, None, None, &[sma.clone(), rsi.clone()]);
        let b = CacheKeys::query_key("600519", Period::Week, None, None, &[rsi, sma]);
        assert_eq!(a, b);
        assert!(a.starts_with(&CacheKeys::instrument_prefix("600519")));
    }

    #[test]
    fn test_query_key_distinguishes_shape() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day = CacheKeys::query_key("AAPL", Period::Day, Some(&start), None, &[]);
        let week = CacheKeys::query_key("AAPL", Period::Week, Some(&start), None, &[]);
        let open = CacheKeys::query_key("AAPL", Period::Day, None, None, &[]);
        assert_ne!(day, week);
        assert_ne!(day, open);
        assert_eq!(day, "query:AAPL:day:2024-01-01:*:");
    }
}
