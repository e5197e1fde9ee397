//! Backward Riccati pass over one time partition.
//!
//! Integrates the matrix/vector/scalar value-function coefficients backward
//! through the partition's samples and exposes the pointwise feedback
//! quantities used for controller synthesis. Constrained directions are
//! handled by a `quu`-weighted range/null-space projection; the
//! constraint-driven linear term propagates separately as `sve`.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::core::interpolation::Lerp;
use crate::core::ode::{rk4_step, OdeState};

use super::error::DdpError;
use super::model_data::{EventLqData, ModelData};

/// Value-function coefficients over one partition, indexed like the
/// partition's nominal trajectory.
#[derive(Debug, Clone, Default)]
pub struct ValueFunctionData {
    pub times: Vec<f64>,
    pub sm: Vec<DMatrix<f64>>,
    pub sv: Vec<DVector<f64>>,
    pub sve: Vec<DVector<f64>>,
    pub s: Vec<f64>,
}

impl ValueFunctionData {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.sm.clear();
        self.sv.clear();
        self.sve.clear();
        self.s.clear();
    }
}

/// Boundary condition of the backward pass at the end of a partition.
#[derive(Debug, Clone)]
pub struct TerminalCondition {
    pub sm: DMatrix<f64>,
    pub sv: DVector<f64>,
    pub sve: DVector<f64>,
    pub s: f64,
}

impl TerminalCondition {
    pub fn zero(state_dim: usize) -> Self {
        Self {
            sm: DMatrix::zeros(state_dim, state_dim),
            sv: DVector::zeros(state_dim),
            sve: DVector::zeros(state_dim),
            s: 0.0,
        }
    }
}

/// Integration state of the backward pass.
#[derive(Debug, Clone)]
struct RiccatiState {
    sm: DMatrix<f64>,
    sv: DVector<f64>,
    sve: DVector<f64>,
    s: f64,
}

impl OdeState for RiccatiState {
    fn add_scaled(&self, other: &Self, scale: f64) -> Self {
        Self {
            sm: &self.sm + &other.sm * scale,
            sv: &self.sv + &other.sv * scale,
            sve: &self.sve + &other.sve * scale,
            s: self.s + other.s * scale,
        }
    }
}

/// Feedback quantities derived from the value function at one sample:
/// the gain `k`, the cost-driven feedforward `l_u` (scaled by the line
/// search), and the constraint-restoration feedforward `l_c` (always
/// applied in full).
#[derive(Debug, Clone)]
pub struct GainSet {
    pub k: DMatrix<f64>,
    pub l_u: DVector<f64>,
    pub l_c: DVector<f64>,
}

/// Computes the projected feedback quantities from the local LQ model and
/// the current value-function coefficients.
pub fn compute_gains(
    md: &ModelData,
    sm: &DMatrix<f64>,
    sv: &DVector<f64>,
    sve: &DVector<f64>,
) -> Result<GainSet, DdpError> {
    let input_dim = md.b.ncols();
    let quu_inv = md
        .quu
        .clone()
        .cholesky()
        .ok_or(DdpError::IllConditioned {
            what: "input cost Hessian is not positive definite",
        })?
        .inverse();

    let hx = &md.qux + md.b.transpose() * sm;
    let hu = &md.qu + md.b.transpose() * (sv + sve);

    if md.num_eq == 0 {
        return Ok(GainSet {
            k: -(&quu_inv * &hx),
            l_u: -(&quu_inv * &hu),
            l_c: DVector::zeros(input_dim),
        });
    }

    // Weighted pseudoinverse of the constraint input Jacobian and the
    // null-space projector of the constrained input directions.
    let d = &md.e_u;
    let drd = d * &quu_inv * d.transpose();
    let drd_inv = drd.cholesky().ok_or(DdpError::IllConditioned {
        what: "state-input constraint Jacobian is rank deficient",
    })?;
    let d_dagger = &quu_inv * d.transpose() * drd_inv.inverse();
    let null_projector = DMatrix::identity(input_dim, input_dim) - &d_dagger * d;

    let k_constraint = -(&d_dagger * &md.e_x);
    let k = &k_constraint + &null_projector * (-(&quu_inv * &hx));
    let l_u = &null_projector * (-(&quu_inv * &hu));
    let l_c = -(&d_dagger * &md.e);

    Ok(GainSet { k, l_u, l_c })
}

fn lerp_model_data(lower: &ModelData, upper: &ModelData, alpha: f64) -> ModelData {
    // Smooth coefficients are blended; the discrete constraint blocks are
    // held from the lower sample (active sets change discretely).
    let mut blended = lower.clone();
    blended.time = Lerp::lerp(&lower.time, &upper.time, alpha);
    blended.a = Lerp::lerp(&lower.a, &upper.a, alpha);
    blended.b = Lerp::lerp(&lower.b, &upper.b, alpha);
    blended.q = Lerp::lerp(&lower.q, &upper.q, alpha);
    blended.qx = Lerp::lerp(&lower.qx, &upper.qx, alpha);
    blended.qu = Lerp::lerp(&lower.qu, &upper.qu, alpha);
    blended.qxx = Lerp::lerp(&lower.qxx, &upper.qxx, alpha);
    blended.quu = Lerp::lerp(&lower.quu, &upper.quu, alpha);
    blended.qux = Lerp::lerp(&lower.qux, &upper.qux, alpha);
    blended
}

/// Time derivative of the value-function coefficients (in forward time)
/// under the locally optimal projected policy.
fn riccati_derivative(
    md: &ModelData,
    state: &RiccatiState,
    fault: &mut Option<DdpError>,
) -> RiccatiState {
    let gains = match compute_gains(md, &state.sm, &state.sv, &state.sve) {
        Ok(gains) => gains,
        Err(error) => {
            if fault.is_none() {
                *fault = Some(error);
            }
            return RiccatiState {
                sm: DMatrix::zeros(state.sm.nrows(), state.sm.ncols()),
                sv: DVector::zeros(state.sv.len()),
                sve: DVector::zeros(state.sve.len()),
                s: 0.0,
            };
        }
    };
    let GainSet { k, l_u, l_c } = gains;

    let hx = &md.qux + md.b.transpose() * &state.sm;
    let closed_a = &md.a + &md.b * &k;
    let kt_quu = k.transpose() * &md.quu;
    let l_total = &l_u + &l_c;

    // Backward equations; the minus sign converts them to forward-time
    // derivatives for the (negative-step) integrator.
    let minus_sm_dot =
        &md.qxx + md.a.transpose() * &state.sm + &state.sm * &md.a + &kt_quu * &k
            + k.transpose() * &hx
            + hx.transpose() * &k;
    let minus_sv_dot = &md.qx
        + closed_a.transpose() * &state.sv
        + &kt_quu * &l_u
        + k.transpose() * &md.qu
        + hx.transpose() * &l_u;
    let minus_sve_dot = closed_a.transpose() * &state.sve
        + (&kt_quu + md.qux.transpose()) * &l_c
        + &state.sm * (&md.b * &l_c);
    let minus_s_dot = md.q
        + l_total.dot(&md.qu)
        + 0.5 * l_total.dot(&(&md.quu * &l_total))
        + (&state.sv + &state.sve).dot(&(&md.b * &l_total));

    RiccatiState {
        sm: -minus_sm_dot,
        sv: -minus_sv_dot,
        sve: -minus_sve_dot,
        s: -minus_s_dot,
    }
}

/// Integrates the Riccati equations backward over one partition and returns
/// the per-sample value-function data plus the boundary condition for the
/// next-earlier partition.
pub fn solve_partition(
    times: &[f64],
    post_event_indices: &[usize],
    model_data: &[ModelData],
    event_data: &[EventLqData],
    terminal: &TerminalCondition,
) -> Result<(ValueFunctionData, TerminalCondition), DdpError> {
    let n = times.len();
    if n == 0 {
        return Ok((ValueFunctionData::default(), terminal.clone()));
    }
    if model_data.len() != n {
        return Err(DdpError::TrajectoryMismatch(format!(
            "model data has {} entries for {} samples",
            model_data.len(),
            n
        )));
    }
    if event_data.len() != post_event_indices.len() {
        return Err(DdpError::TrajectoryMismatch(format!(
            "event data has {} entries for {} post-event samples",
            event_data.len(),
            post_event_indices.len()
        )));
    }

    let mut value = ValueFunctionData {
        times: times.to_vec(),
        sm: vec![DMatrix::zeros(0, 0); n],
        sv: vec![DVector::zeros(0); n],
        sve: vec![DVector::zeros(0); n],
        s: vec![0.0; n],
    };

    let mut state = RiccatiState {
        sm: terminal.sm.clone(),
        sv: terminal.sv.clone(),
        sve: terminal.sve.clone(),
        s: terminal.s,
    };
    store_sample(&mut value, n - 1, &state);

    for k in (0..n - 1).rev() {
        let post_index = k + 1;
        if post_event_indices.contains(&post_index) {
            // Sample k is the pre-jump twin of sample k+1: no integration,
            // just add the event-time quadratic approximation.
            let event_position = post_event_indices
                .iter()
                .position(|&idx| idx == post_index)
                .expect("index located above");
            let event = &event_data[event_position];
            state.sm += &event.qxx;
            state.sv += &event.qx;
            state.s += event.q;
        } else {
            let dt = times[k] - times[post_index];
            let t_upper = times[post_index];
            let span = times[post_index] - times[k];
            let mut fault: Option<DdpError> = None;
            let lower = &model_data[k];
            let upper = &model_data[post_index];
            state = rk4_step(dt, t_upper, &state, &mut |t_stage, state_stage| {
                let alpha = if span > 0.0 {
                    ((t_stage - times[k]) / span).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let blended = lerp_model_data(lower, upper, alpha);
                riccati_derivative(&blended, state_stage, &mut fault)
            });
            if let Some(error) = fault {
                return Err(error);
            }
        }
        // Keep the quadratic term symmetric against integration drift.
        state.sm = 0.5 * (&state.sm + state.sm.transpose());
        store_sample(&mut value, k, &state);
    }

    let boundary = TerminalCondition {
        sm: state.sm,
        sv: state.sv,
        sve: state.sve,
        s: state.s,
    };
    Ok((value, boundary))
}

fn store_sample(value: &mut ValueFunctionData, index: usize, state: &RiccatiState) {
    value.sm[index] = state.sm.clone();
    value.sv[index] = state.sv.clone();
    value.sve[index] = state.sve.clone();
    value.s[index] = state.s;
}

/// Splits the active partitions into contiguous blocks, one per worker,
/// balancing the total sample count per block (partitions differ wildly in
/// sample count, so balancing partition counts would skew the load).
pub fn distribute_partitions(sample_counts: &[usize], num_workers: usize) -> Vec<Range<usize>> {
    assert!(num_workers > 0);
    let num_partitions = sample_counts.len();
    if num_partitions == 0 {
        return Vec::new();
    }
    let total: usize = sample_counts.iter().sum();
    let num_blocks = num_workers.min(num_partitions);
    let target = (total as f64) / (num_blocks as f64);

    let mut blocks = Vec::with_capacity(num_blocks);
    let mut begin = 0;
    let mut accumulated = 0usize;
    for (i, &count) in sample_counts.iter().enumerate() {
        accumulated += count;
        let blocks_remaining = num_blocks - blocks.len();
        let partitions_remaining = num_partitions - i - 1;
        let reached_target = (accumulated as f64) >= target * ((blocks.len() + 1) as f64);
        // Never leave more blocks to fill than partitions to put in them.
        if (reached_target && blocks_remaining > 1) || partitions_remaining + 1 == blocks_remaining
        {
            blocks.push(begin..i + 1);
            begin = i + 1;
        }
    }
    if begin < num_partitions {
        blocks.push(begin..num_partitions);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn double_integrator_model(t: f64) -> ModelData {
        ModelData {
            time: t,
            a: DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]),
            b: DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
            q: 0.0,
            qx: DVector::zeros(2),
            qu: DVector::zeros(1),
            qxx: DMatrix::identity(2, 2),
            quu: DMatrix::identity(1, 1),
            qux: DMatrix::zeros(1, 2),
            num_eq: 0,
            e: DVector::zeros(0),
            e_x: DMatrix::zeros(0, 2),
            e_u: DMatrix::zeros(0, 1),
            num_state_eq: 0,
            h: DVector::zeros(0),
            h_x: DMatrix::zeros(0, 2),
            num_ineq: 0,
            g: DVector::zeros(0),
        }
    }

    #[test]
    fn test_converges_to_algebraic_riccati_solution() {
        // Double integrator with Q = I, R = 1: the stationary solution is
        // Sm = [[sqrt(3), 1], [1, sqrt(3)]] with gain K = -[1, sqrt(3)].
        let n = 2001;
        let t_final = 20.0;
        let times: Vec<f64> = (0..n)
            .map(|k| t_final * (k as f64) / ((n - 1) as f64))
            .collect();
        let model_data: Vec<ModelData> =
            times.iter().map(|&t| double_integrator_model(t)).collect();
        let terminal = TerminalCondition {
            sm: DMatrix::identity(2, 2),
            sv: DVector::zeros(2),
            sve: DVector::zeros(2),
            s: 0.0,
        };
        let (value, boundary) =
            solve_partition(&times, &[], &model_data, &[], &terminal).unwrap();

        let sqrt3 = 3.0_f64.sqrt();
        assert_relative_eq!(boundary.sm[(0, 0)], sqrt3, epsilon = 1e-3);
        assert_relative_eq!(boundary.sm[(0, 1)], 1.0, epsilon = 1e-3);
        assert_relative_eq!(boundary.sm[(1, 1)], sqrt3, epsilon = 1e-3);

        let gains = compute_gains(
            &model_data[0],
            &value.sm[0],
            &value.sv[0],
            &value.sve[0],
        )
        .unwrap();
        assert_relative_eq!(gains.k[(0, 0)], -1.0, epsilon = 1e-3);
        assert_relative_eq!(gains.k[(0, 1)], -sqrt3, epsilon = 1e-3);
    }

    #[test]
    fn test_event_jump_adds_event_data() {
        let times = vec![0.0, 1.0, 1.0, 2.0];
        let model_data: Vec<ModelData> =
            times.iter().map(|&t| double_integrator_model(t)).collect();
        let event = EventLqData {
            time: 1.0,
            q: 5.0,
            qx: DVector::from_vec(vec![1.0, 0.0]),
            qxx: DMatrix::identity(2, 2),
            num_final_eq: 0,
            h: DVector::zeros(0),
        };
        let terminal = TerminalCondition::zero(2);
        let (value, _) =
            solve_partition(&times, &[2], &model_data, &[event], &terminal).unwrap();

        // Across the event pair (indices 1 and 2) the scalar term jumps by
        // exactly the event cost.
        assert_relative_eq!(value.s[1] - value.s[2], 5.0, epsilon = 1e-12);
        assert_relative_eq!(value.sv[1][0] - value.sv[2][0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constrained_gains_restore_feasibility() {
        // One active constraint u - 2 = 0 around a nominal with e = -2
        // (u_nom = 0): the restoration feedforward must be +2 and the
        // cost-driven update must vanish (no null space left).
        let mut md = double_integrator_model(0.0);
        md.num_eq = 1;
        md.e = DVector::from_vec(vec![-2.0]);
        md.e_x = DMatrix::zeros(1, 2);
        md.e_u = DMatrix::identity(1, 1);
        let gains = compute_gains(
            &md,
            &DMatrix::zeros(2, 2),
            &DVector::zeros(2),
            &DVector::zeros(2),
        )
        .unwrap();
        assert_relative_eq!(gains.l_c[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(gains.l_u[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(gains.k[(0, 0)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_distribute_partitions_balances_samples() {
        let counts = [100, 100, 100, 100];
        let blocks = distribute_partitions(&counts, 2);
        assert_eq!(blocks, vec![0..2, 2..4]);

        // A heavy partition gets a block of its own.
        let counts = [1000, 10, 10, 10];
        let blocks = distribute_partitions(&counts, 2);
        assert_eq!(blocks[0], 0..1);
        assert_eq!(blocks[1], 1..4);
    }

    #[test]
    fn test_distribute_partitions_never_exceeds_partition_count() {
        let blocks = distribute_partitions(&[5, 5], 8);
        assert_eq!(blocks.len(), 2);
        let covered: usize = blocks.iter().map(|r| r.len()).sum();
        assert_eq!(covered, 2);
    }
}
