//! Trajectory caching across receding-horizon re-solves.
//!
//! The cached set is the previous iteration's nominal trajectories; when
//! partition boundaries slide between MPC calls the cached tail is extended
//! from the new nominal so that value-function and warm-start queries
//! against slightly stale boundaries stay valid.

use approx::relative_eq;

use crate::core::interpolation::{self, Lerp};
use crate::ocp::trajectory::Trajectory;

use super::error::DdpError;

/// Margin added to the cached end time when locating the corresponding
/// segment of the new nominal trajectory; keeps the bridge point strictly
/// after the cached end.
const TAIL_EPSILON: f64 = 1e-9;

/// Swaps the nominal per-partition trajectories into the cache (and the old
/// cache out, to be overwritten by the next rollout).
pub fn swap_nominal_to_cache(nominal: &mut [Trajectory], cached: &mut [Trajectory]) {
    debug_assert_eq!(nominal.len(), cached.len());
    for (nominal, cached) in nominal.iter_mut().zip(cached.iter_mut()) {
        std::mem::swap(nominal, cached);
    }
}

/// Brings one partition's cached trajectory up to date against the freshly
/// rolled-out nominal one:
///
/// * empty cache: adopt the nominal wholesale;
/// * cached end before the nominal end: interpolate a bridging point at the
///   cached end and append the nominal tail beyond it, leaving the cached
///   prefix untouched and the time sequence non-decreasing.
pub fn correct_cached_tail(
    nominal: &Trajectory,
    cached: &mut Trajectory,
    debug_check: bool,
) -> Result<(), DdpError> {
    if cached.is_empty() {
        *cached = nominal.clone();
        return Ok(());
    }
    let cached_end = *cached.times.last().expect("cached is non-empty");
    let nominal_end = match nominal.times.last() {
        Some(&t) => t,
        None => return Ok(()),
    };
    if cached_end >= nominal_end {
        return Ok(());
    }

    let bridge_time = cached_end + TAIL_EPSILON;
    let segment = interpolation::time_segment(bridge_time, &nominal.times);
    let size_before = cached.len();

    // Post-event markers of the appended tail, re-indexed into the cache.
    for &index in &nominal.post_event_indices {
        if index > segment.index {
            cached
                .post_event_indices
                .push(index - segment.index + size_before);
        }
    }

    append_tail(segment, &nominal.times, &mut cached.times);
    append_tail(segment, &nominal.states, &mut cached.states);
    append_tail(segment, &nominal.inputs, &mut cached.inputs);

    if debug_check {
        verify_tail(nominal, cached, segment.index)?;
    }
    Ok(())
}

/// Pushes the interpolated bridging sample and then the nominal tail.
fn append_tail<V: Lerp + Clone>(
    segment: interpolation::TimeSegment,
    nominal: &[V],
    cached: &mut Vec<V>,
) {
    cached.push(interpolation::interpolate(segment, nominal));
    cached.extend_from_slice(&nominal[segment.index + 1..]);
}

fn verify_tail(
    nominal: &Trajectory,
    cached: &Trajectory,
    from_index: usize,
) -> Result<(), DdpError> {
    for k in from_index + 1..nominal.len() {
        let time = nominal.times[k];
        let state = cached.state_at(time);
        if !relative_eq!(
            (state - &nominal.states[k]).norm(),
            0.0,
            epsilon = 1e-6
        ) {
            return Err(DdpError::CacheInconsistency(format!(
                "state tail mismatch at t = {}",
                time
            )));
        }
        let input = cached.input_at(time);
        if !relative_eq!(
            (input - &nominal.inputs[k]).norm(),
            0.0,
            epsilon = 1e-6
        ) {
            return Err(DdpError::CacheInconsistency(format!(
                "input tail mismatch at t = {}",
                time
            )));
        }
    }
    Ok(())
}
