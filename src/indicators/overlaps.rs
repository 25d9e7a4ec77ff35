use crate::indicators::ta::{self, finite_points};
use crate::models::{Bar, IndicatorPoint, IndicatorSeries, IndicatorValue, PriceField};

pub struct OverlapCalculator;

impl OverlapCalculator {
    // Calculate SMA (Simple Moving Average)
    pub fn calculate_sma(bars: &[Bar], period: usize, source: PriceField) -> IndicatorSeries {
        let (times, values) = finite_points(bars, source);
        ta::rolling_mean(&values, period)
            .into_iter()
            .enumerate()
            .map(|(i, v)| IndicatorPoint::single(times[i + period - 1], v))
            .collect()
    }

    // Calculate EMA (Exponential Moving Average)
    pub fn calculate_ema(bars: &[Bar], period: usize, source: PriceField) -> IndicatorSeries {
        let (times, values) = finite_points(bars, source);
        ta::ema(&values, period)
            .into_iter()
            .enumerate()
            .map(|(i, v)| IndicatorPoint::single(times[i + period - 1], v))
            .collect()
    }

    // Calculate Bollinger Bands (SMA middle line, bands at `multiplier` population std devs)
    pub fn calculate_bollinger_bands(bars: &[Bar], period: usize, multiplier: f64) -> IndicatorSeries {
        let (times, closes) = finite_points(bars, PriceField::Close);
        if period == 0 || closes.len() < period {
            return Vec::new();
        }

        closes
            .windows(period)
            .enumerate()
            .map(|(i, window)| {
                let middle = ta::mean(window);
                let offset = multiplier * ta::population_std_dev(window);
                IndicatorPoint {
                    time: times[i + period - 1],
                    value: IndicatorValue::Bands {
                        upper: middle + offset,
                        middle,
                        lower: middle - offset,
                    },
                }
            })
            .collect()
    }
}
