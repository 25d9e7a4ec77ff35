use chrono::NaiveDate;
use std::future::Future;
use std::time::Instant;
use tracing::debug;

// Utility function to measure execution time of operations
pub async fn measure_time<F, T>(operation_name: &str, f: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    debug!("{} completed in {:.2?}", operation_name, elapsed);

    result
}

/// Synchronous counterpart of `measure_time` for the pure computation paths.
pub fn measure_sync<T>(operation_name: &str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    debug!("{} completed in {:.2?}", operation_name, start.elapsed());
    result
}

// Format a bar date the way cache keys and logs print it
pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// Utility to truncate long strings for logging
pub fn truncate_string(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        None => s.to_string(),
        Some((idx, _)) => format!("{}...", &s[..idx]),
    }
}
