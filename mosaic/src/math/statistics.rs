//! Robust statistics on f64 samples: median, MAD, sigma clipping.

/// MAD (Median Absolute Deviation) to standard deviation conversion factor.
///
/// For a normal distribution, σ ≈ 1.4826 × MAD.
pub const MAD_TO_SIGMA: f64 = 1.482_602_218_505_602;

/// Median of `data`. Reorders the buffer. Returns `None` for empty input.
pub fn median_mut(data: &mut [f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let len = data.len();
    let mid = len / 2;
    let (left, upper, _) = data.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if len % 2 == 1 {
        Some(upper)
    } else {
        let lower = left.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(0.5 * (lower + upper))
    }
}

/// Median and MAD together. Reorders the buffer.
pub fn median_and_mad_mut(data: &mut [f64]) -> Option<(f64, f64)> {
    let median = median_mut(data)?;
    for v in data.iter_mut() {
        *v = (*v - median).abs();
    }
    let mad = median_mut(data)?;
    Some((median, mad))
}

/// MAD-based standard deviation of `values`, 0 for fewer than two samples.
pub fn robust_sigma(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mut scratch = values.to_vec();
    median_and_mad_mut(&mut scratch)
        .map(|(_, mad)| mad * MAD_TO_SIGMA)
        .unwrap_or(0.0)
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Standard deviation after `iterations` rounds of nested `kappa`-sigma clipping
/// about the mean.
///
/// Each round keeps the values within `kappa · std` of the current mean, so the
/// kept sets are nested. With `kappa >= 1` every round removes only values whose
/// squared deviation exceeds the current variance, so the result never
/// increases with `iterations`.
pub fn clipped_std(values: &[f64], kappa: f64, iterations: usize) -> f64 {
    clipped_std_history(values, kappa, iterations)
        .last()
        .copied()
        .unwrap_or(0.0)
}

/// Standard deviation after 0, 1, ..., `iterations` clipping rounds.
pub fn clipped_std_history(values: &[f64], kappa: f64, iterations: usize) -> Vec<f64> {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let mut history = Vec::with_capacity(iterations + 1);
    let (mut mean, mut std) = mean_std(&kept);
    history.push(std);
    for _ in 0..iterations {
        let threshold = kappa * std;
        kept.retain(|v| (v - mean).abs() <= threshold);
        (mean, std) = mean_std(&kept);
        history.push(std);
    }
    history
}
