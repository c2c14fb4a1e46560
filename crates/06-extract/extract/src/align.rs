//! Cross-source alignment against a seed timestamp series.
//!
//! Seed timestamps (typically the mesoscope-frame TTL rising edges) are the
//! only cross-source interpolation path the core guarantees: continuous
//! signals interpolate linearly, discrete signals hold their previous value.

/// Linearly interpolates `(ts, values)` at each seed timestamp.
///
/// Seeds before the first sample clamp to the first value, seeds past the
/// last sample clamp to the last. Returns an empty vector when the series
/// is empty.
pub fn interpolate_linear(seed_ts: &[u64], ts: &[u64], values: &[f64]) -> Vec<f64> {
    debug_assert_eq!(ts.len(), values.len());
    if ts.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(seed_ts.len());
    let mut cursor = 0usize;
    for &seed in seed_ts {
        while cursor + 1 < ts.len() && ts[cursor + 1] <= seed {
            cursor += 1;
        }
        let value = if seed <= ts[0] {
            values[0]
        } else if cursor + 1 >= ts.len() {
            values[ts.len() - 1]
        } else {
            let (t0, t1) = (ts[cursor], ts[cursor + 1]);
            let (v0, v1) = (values[cursor], values[cursor + 1]);
            if t1 == t0 {
                v1
            } else {
                let fraction = (seed - t0) as f64 / (t1 - t0) as f64;
                v0 + (v1 - v0) * fraction
            }
        };
        out.push(value);
    }
    out
}

/// Piecewise-constant interpolation: each seed takes the most recent value
/// at or before it; seeds before the first sample take the first value.
pub fn interpolate_previous<T: Copy>(seed_ts: &[u64], ts: &[u64], values: &[T]) -> Vec<T> {
    debug_assert_eq!(ts.len(), values.len());
    if ts.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(seed_ts.len());
    let mut cursor = 0usize;
    for &seed in seed_ts {
        while cursor + 1 < ts.len() && ts[cursor + 1] <= seed {
            cursor += 1;
        }
        if seed < ts[0] {
            out.push(values[0]);
        } else {
            out.push(values[cursor]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_interpolation_hits_midpoints() {
        let ts = [0u64, 100, 200];
        let values = [0.0, 10.0, 30.0];
        let seeds = [0u64, 50, 150, 200];
        assert_eq!(
            interpolate_linear(&seeds, &ts, &values),
            vec![0.0, 5.0, 20.0, 30.0]
        );
    }

    #[test]
    fn linear_interpolation_clamps_out_of_range_seeds() {
        let ts = [100u64, 200];
        let values = [1.0, 2.0];
        assert_eq!(
            interpolate_linear(&[0, 500], &ts, &values),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn previous_value_holds_between_samples() {
        let ts = [100u64, 200, 300];
        let values = [1u8, 0, 1];
        let seeds = [50u64, 100, 250, 400];
        assert_eq!(
            interpolate_previous(&seeds, &ts, &values),
            vec![1, 1, 0, 1]
        );
    }

    #[test]
    fn empty_series_yields_empty_alignment() {
        assert!(interpolate_linear(&[1, 2], &[], &[]).is_empty());
        assert!(interpolate_previous::<u8>(&[1, 2], &[], &[]).is_empty());
    }
}
