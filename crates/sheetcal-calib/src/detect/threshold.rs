//! Thresholding of ridge responses.

/// Otsu's threshold over 8-bit ridge responses.
///
/// Values above the returned level belong to the bright class. With no
/// samples the result is mid-range; with two distinct levels it is their
/// midpoint.
pub(crate) fn otsu_threshold_from_samples(samples: &[u8]) -> u8 {
    let mut counts = [0u64; 256];
    for &s in samples {
        counts[usize::from(s)] += 1;
    }

    let occupied: Vec<usize> = (0..256).filter(|&i| counts[i] > 0).collect();
    match occupied.as_slice() {
        [] => return 127,
        [only] => return *only as u8,
        [lo, hi] => return ((lo + hi) / 2) as u8,
        _ => {}
    }

    let n = samples.len() as f64;
    let mean_all = counts
        .iter()
        .enumerate()
        .map(|(level, &c)| level as f64 * c as f64)
        .sum::<f64>()
        / n;

    // class-0 size and first moment, accumulated level by level
    let (mut below, mut m0) = (0u64, 0.0f64);
    let mut best = (f64::NEG_INFINITY, 127u8);
    for (level, &c) in counts.iter().enumerate() {
        below += c;
        m0 += level as f64 * c as f64 / n;
        if below == 0 || below as usize == samples.len() {
            continue;
        }
        let p0 = below as f64 / n;
        let diff = mean_all * p0 - m0;
        let between = diff * diff / (p0 * (1.0 - p0));
        if between > best.0 {
            best = (between, level as u8);
        }
    }
    best.1
}
