use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Linear-interpolation percentile over the sorted values.
///
/// The rank is `(n - 1) * pct / 100`; results between two sorted samples are
/// blended by the fractional part of the rank. Returns `None` for empty input.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let last = sorted.len() - 1;
    let k = last as f64 * (pct / 100.0);
    let f = (k.floor().max(0.0) as usize).min(last);
    let c = (f + 1).min(last);
    if f == c {
        return Some(sorted[f]);
    }
    Some(sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64))
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub durations_s: Vec<f64>,
    pub p50_s: Option<f64>,
    pub p95_s: Option<f64>,
    pub mean_s: Option<f64>,
}

impl TimingSummary {
    pub fn from_samples(durations_s: Vec<f64>) -> Self {
        let p50_s = percentile(&durations_s, 50.0);
        let p95_s = percentile(&durations_s, 95.0);
        let mean_s = mean(&durations_s);
        Self {
            durations_s,
            p50_s,
            p95_s,
            mean_s,
        }
    }

    pub fn p50_ms(&self) -> Option<f64> {
        self.p50_s.map(|s| s * 1000.0)
    }

    pub fn p95_ms(&self) -> Option<f64> {
        self.p95_s.map(|s| s * 1000.0)
    }
}

/// Runs `op` `warmup` times untimed, then `max(iters, 1)` times timed.
///
/// Device synchronization is the caller's job: `op` must block until its
/// work is complete if the wall-clock sample is meant to include it.
pub fn time_operation<T, F>(mut op: F, warmup: usize, iters: usize) -> TimingSummary
where
    F: FnMut() -> T,
{
    for _ in 0..warmup {
        let _ = op();
    }
    let mut durations = Vec::with_capacity(iters.max(1));
    for _ in 0..iters.max(1) {
        let start = Instant::now();
        let out = op();
        durations.push(start.elapsed().as_secs_f64());
        drop(out);
    }
    TimingSummary::from_samples(durations)
}

pub fn try_time_operation<T, E, F>(
    mut op: F,
    warmup: usize,
    iters: usize,
) -> Result<TimingSummary, E>
where
    F: FnMut() -> Result<T, E>,
{
    for _ in 0..warmup {
        op()?;
    }
    let mut durations = Vec::with_capacity(iters.max(1));
    for _ in 0..iters.max(1) {
        let start = Instant::now();
        let out = op()?;
        durations.push(start.elapsed().as_secs_f64());
        drop(out);
    }
    Ok(TimingSummary::from_samples(durations))
}
