// Window and recursive primitives shared by the indicator calculators.
// Everything works on plain f64 slices; alignment to bar times is the caller's job.

use crate::models::{Bar, PriceField};
use chrono::NaiveDate;

/// Arithmetic mean. Callers never pass an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by N).
pub fn population_std_dev(values: &[f64]) -> f64 {
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

pub fn highest(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

pub fn lowest(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

/// Rolling mean; element `i` covers `values[i..i + period]`.
pub fn rolling_mean(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    values.windows(period).map(mean).collect()
}

/// Exponential moving average seeded with the SMA of the first `period` values.
///
/// Element `i` of the output lines up with `values[i + period - 1]`. The update is
/// written as `x * k + prev * (1 - k)`, which is the same recurrence as
/// `(x - prev) * k + prev` but reproduces the input exactly when `period == 1`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = mean(&values[..period]);

    std::iter::once(seed)
        .chain(values[period..].iter().scan(seed, |prev, &x| {
            *prev = x * k + *prev * (1.0 - k);
            Some(*prev)
        }))
        .collect()
}

/// `(time, value)` pairs for one bar column, skipping non-finite values.
pub fn finite_points(bars: &[Bar], field: PriceField) -> (Vec<NaiveDate>, Vec<f64>) {
    bars.iter()
        .map(|b| (b.time, b.field(field)))
        .filter(|(_, v)| v.is_finite())
        .unzip()
}
