//! Aggregation math that turns raw byte/time samples into
//! bits-per-second and latency statistics.

/// Arithmetic mean of the samples.
///
/// Returns NaN for an empty sample set; callers must guarantee
/// non-empty input.
pub fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Population standard deviation of the samples (divide by N, not N-1).
///
/// This is the jitter figure reported for latency probes. Returns NaN
/// for an empty sample set.
pub fn jitter(samples: &[f64]) -> f64 {
    let m = mean(samples);
    let variance = samples.iter().map(|s| (s - m).powi(2)).sum::<f64>()
        / samples.len() as f64;

    variance.sqrt()
}

/// Throughput in megabits per second: `(bytes * 8) / seconds / 1e6`.
///
/// A zero `elapsed_ms` yields a non-finite value (infinity, or NaN when
/// `total_bytes` is also zero); the session records such measurements
/// as unmeasured instead of displaying them.
pub fn throughput_mbps(total_bytes: u64, elapsed_ms: f64) -> f64 {
    (total_bytes as f64 * 8.0) / (elapsed_ms / 1000.0) / 1e6
}
