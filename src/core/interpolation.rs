use nalgebra::{DMatrix, DVector};

/// Trait for values that can be linearly blended between two samples.
pub trait Lerp {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self;
}

impl Lerp for f64 {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

impl Lerp for DVector<f64> {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

impl Lerp for DMatrix<f64> {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

/// Resolved position of a query time within a sorted time array: the data
/// lives between `index` and `index + 1`, blended by `alpha` in [0, 1].
///
/// Reusing one `TimeSegment` across several parallel data arrays keeps their
/// interpolated samples consistent with each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSegment {
    pub index: usize,
    pub alpha: f64,
}

/// Locates `time` within `times` (sorted ascending, possibly with repeated
/// entries at event boundaries). Queries outside the array are clamped to
/// the first/last segment.
pub fn time_segment(time: f64, times: &[f64]) -> TimeSegment {
    assert!(!times.is_empty(), "time array must not be empty");
    if times.len() == 1 || time <= times[0] {
        return TimeSegment {
            index: 0,
            alpha: 0.0,
        };
    }
    let last = times.len() - 1;
    if time >= times[last] {
        return TimeSegment {
            index: last - 1,
            alpha: 1.0,
        };
    }

    // First index with times[idx] > time; the segment starts one before it.
    let idx_upp = times.partition_point(|&t| t <= time);
    let idx_low = idx_upp - 1;
    let dt = times[idx_upp] - times[idx_low];
    let alpha = if dt > 0.0 {
        (time - times[idx_low]) / dt
    } else {
        // Repeated timestamp (event boundary): land on the earlier sample.
        0.0
    };
    TimeSegment {
        index: idx_low,
        alpha,
    }
}

/// Interpolates a data array at a previously resolved segment.
pub fn interpolate<V: Lerp>(segment: TimeSegment, data: &[V]) -> V {
    assert!(
        segment.index + 1 < data.len(),
        "segment index out of bounds for data array"
    );
    V::lerp(&data[segment.index], &data[segment.index + 1], segment.alpha)
}

/// Convenience wrapper: resolve the segment and interpolate in one call.
pub fn interpolate_at<V: Lerp>(time: f64, times: &[f64], data: &[V]) -> V {
    interpolate(time_segment(time, times), data)
}
