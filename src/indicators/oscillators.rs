use crate::indicators::ta::{self, finite_points};
use crate::models::{Bar, IndicatorPoint, IndicatorSeries, IndicatorValue, PriceField};
use chrono::NaiveDate;

/// Starting value of both smoothed KDJ lines before any bar is seen.
const KDJ_SEED: f64 = 50.0;

pub struct OscillatorCalculator;

impl OscillatorCalculator {
    /// RSI over closes using simple averages of the last `period` gains and losses.
    ///
    /// The first point lands on bar index `period`, since `period` changes need
    /// `period + 1` closes. A window without losses reads 100.
    pub fn calculate_rsi(bars: &[Bar], period: usize) -> IndicatorSeries {
        let (times, closes) = finite_points(bars, PriceField::Close);
        if period == 0 || closes.len() <= period {
            return Vec::new();
        }

        let changes: Vec<(f64, f64)> = closes
            .windows(2)
            .map(|w| {
                let change = w[1] - w[0];
                (change.max(0.0), (-change).max(0.0))
            })
            .collect();

        changes
            .windows(period)
            .enumerate()
            .map(|(i, window)| {
                let avg_gain = window.iter().map(|(g, _)| g).sum::<f64>() / period as f64;
                let avg_loss = window.iter().map(|(_, l)| l).sum::<f64>() / period as f64;
                let rsi = if avg_loss == 0.0 {
                    100.0
                } else {
                    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
                };
                IndicatorPoint::single(times[i + period], rsi)
            })
            .collect()
    }

    /// MACD line, signal line and histogram over closes.
    ///
    /// Points are emitted from the first bar where the signal line exists, so every
    /// point carries all three values.
    pub fn calculate_macd(bars: &[Bar], fast: usize, slow: usize, signal: usize) -> IndicatorSeries {
        let (times, closes) = finite_points(bars, PriceField::Close);
        if fast == 0 || slow == 0 || signal == 0 {
            return Vec::new();
        }

        let fast_ema = ta::ema(&closes, fast);
        let slow_ema = ta::ema(&closes, slow);
        let start = fast.max(slow) - 1;
        if closes.len() <= start {
            return Vec::new();
        }

        // Align both averages on the later-starting one.
        let macd_line: Vec<f64> = (start..closes.len())
            .map(|idx| fast_ema[idx + 1 - fast] - slow_ema[idx + 1 - slow])
            .collect();
        let signal_line = ta::ema(&macd_line, signal);

        signal_line
            .iter()
            .enumerate()
            .map(|(k, &signal_value)| {
                let macd = macd_line[k + signal - 1];
                IndicatorPoint {
                    time: times[start + signal - 1 + k],
                    value: IndicatorValue::Macd {
                        macd,
                        signal: signal_value,
                        histogram: macd - signal_value,
                    },
                }
            })
            .collect()
    }

    /// KDJ stochastic over a `k_period` high/low window.
    ///
    /// K and D are smoothed with fixed 1/3 weights starting from 50; `d_period` and
    /// `j_period` only shape the display name. A flat window (highest == lowest)
    /// reads as an RSV of 50.
    pub fn calculate_kdj(bars: &[Bar], k_period: usize, _d_period: usize, _j_period: usize) -> IndicatorSeries {
        let rows: Vec<(NaiveDate, f64, f64, f64)> = bars
            .iter()
            .filter(|b| b.high.is_finite() && b.low.is_finite() && b.close.is_finite())
            .map(|b| (b.time, b.high, b.low, b.close))
            .collect();
        if k_period == 0 || rows.len() < k_period {
            return Vec::new();
        }

        rows.windows(k_period)
            .scan((KDJ_SEED, KDJ_SEED), |(prev_k, prev_d), window| {
                let (time, _, _, close) = window[window.len() - 1];
                let highs: Vec<f64> = window.iter().map(|r| r.1).collect();
                let lows: Vec<f64> = window.iter().map(|r| r.2).collect();
                let (hh, ll) = (ta::highest(&highs), ta::lowest(&lows));

                let rsv = if hh > ll { (close - ll) / (hh - ll) * 100.0 } else { KDJ_SEED };
                let k = (2.0 * *prev_k + rsv) / 3.0;
                let d = (2.0 * *prev_d + k) / 3.0;
                *prev_k = k;
                *prev_d = d;

                Some(IndicatorPoint {
                    time,
                    value: IndicatorValue::Kdj { k, d, j: 3.0 * k - 2.0 * d },
                })
            })
            .collect()
    }
}
