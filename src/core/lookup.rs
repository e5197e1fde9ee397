use more_asserts::assert_ge;

/// Index of the partition interval containing `time`: the largest `i` with
/// `boundaries[i] <= time`, clamped so that a query before the first or
/// after the last boundary still maps to a valid interval `[i, i + 1)`.
pub fn bounded_active_interval(boundaries: &[f64], time: f64) -> usize {
    assert_ge!(boundaries.len(), 2, "need at least one partition interval");
    let idx_upp = boundaries.partition_point(|&t| t <= time);
    // idx_upp is in [0, len]; the interval index must stay in [0, len - 2].
    idx_upp.saturating_sub(1).min(boundaries.len() - 2)
}

/// First index whose entry is strictly greater than `value` (the length of
/// the prefix with entries `<= value`).
pub fn upper_bound(times: &[f64], value: f64) -> usize {
    times.partition_point(|&t| t <= value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_active_interval() {
        let boundaries = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(bounded_active_interval(&boundaries, -0.5), 0);
        assert_eq!(bounded_active_interval(&boundaries, 0.0), 0);
        assert_eq!(bounded_active_interval(&boundaries, 1.5), 1);
        assert_eq!(bounded_active_interval(&boundaries, 2.0), 2);
        assert_eq!(bounded_active_interval(&boundaries, 3.0), 2);
        assert_eq!(bounded_active_interval(&boundaries, 99.0), 2);
    }

    #[test]
    fn test_upper_bound() {
        let times = [0.0, 1.0, 1.0, 2.0];
        assert_eq!(upper_bound(&times, -1.0), 0);
        assert_eq!(upper_bound(&times, 1.0), 3);
        assert_eq!(upper_bound(&times, 5.0), 4);
    }
}
