//! Fixed-length linear resampling.

/// Length the SOH model expects for every channel.
pub const TARGET_LEN: usize = 128;

/// Map `source` onto exactly `target_len` evenly spaced points by linear
/// interpolation over `[0, n-1]`.
///
/// Empty input gives zeros, a single value is repeated, and an input already
/// `target_len` long is copied unchanged. A `target_len` of 1 takes the first
/// source value.
pub fn resample(source: &[f64], target_len: usize) -> Vec<f64> {
    let n = source.len();
    match n {
        0 => return vec![0.0; target_len],
        1 => return vec![source[0]; target_len],
        _ if n == target_len => return source.to_vec(),
        _ => {}
    }
    if target_len <= 1 {
        return source[..target_len].to_vec();
    }

    let span = (n - 1) as f64;
    let last = (target_len - 1) as f64;
    (0..target_len)
        .map(|i| {
            let pos = i as f64 / last * span;
            let i0 = (pos.floor() as usize).min(n - 1);
            let i1 = (i0 + 1).min(n - 1);
            let t = pos - i0 as f64;
            source[i0] * (1.0 - t) + source[i1] * t
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_target_length() {
        for n in [0usize, 1, 2, 3, 127, 128, 129, 1000] {
            let src: Vec<f64> = (0..n).map(|i| i as f64 * 0.5).collect();
            assert_eq!(resample(&src, TARGET_LEN).len(), TARGET_LEN, "n = {n}");
        }
    }

    #[test]
    fn degenerate_inputs() {
        assert!(resample(&[], TARGET_LEN).iter().all(|v| *v == 0.0));
        assert!(resample(&[4.2], TARGET_LEN).iter().all(|v| *v == 4.2));
    }

    #[test]
    fn identity_at_target_length() {
        let src: Vec<f64> = (0..TARGET_LEN).map(|i| (i as f64).sin()).collect();
        assert_eq!(resample(&src, TARGET_LEN), src);
    }

    #[test]
    fn interpolates_linear_ramp_exactly_at_ends() {
        let out = resample(&[0.0, 10.0], 5);
        assert_eq!(out, vec![0.0, 2.5, 5.0, 7.5, 10.0]);

        let src: Vec<f64> = (0..300).map(|i| i as f64).collect();
        let out = resample(&src, TARGET_LEN);
        assert_eq!(out[0], 0.0);
        assert!((out[TARGET_LEN - 1] - 299.0).abs() < 1e-9);
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn tiny_targets() {
        assert!(resample(&[1.0, 2.0, 3.0], 0).is_empty());
        assert_eq!(resample(&[1.0, 2.0, 3.0], 1), vec![1.0]);
    }
}
