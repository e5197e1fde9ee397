//! Greedy parallel line search over a geometric learning-rate schedule.
//!
//! Workers atomically claim candidate exponents (largest step first), roll
//! out the perturbed controller, and race to publish the best accepted step.
//! Acceptance is monotone in the learning rate, so once every larger
//! candidate is resolved the coordinator cancels all in-flight rollouts of
//! smaller ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::core::ode::CancellationToken;

use super::error::DdpError;

/// Geometric candidate schedule `alpha_k = max_alpha * contraction^k`,
/// evaluated down to `min_alpha`.
#[derive(Debug, Clone)]
pub struct LineSearchSchedule {
    pub max_alpha: f64,
    pub min_alpha: f64,
    pub contraction: f64,
}

impl LineSearchSchedule {
    pub fn alpha(&self, exponent: usize) -> f64 {
        self.max_alpha * self.contraction.powi(exponent as i32)
    }

    pub fn num_candidates(&self) -> usize {
        let ratio = self.min_alpha / self.max_alpha;
        (ratio.ln() / self.contraction.ln()).floor() as usize + 1
    }
}

/// The accepted step of one search.
#[derive(Debug, Clone)]
pub struct AcceptedStep<T> {
    pub alpha: f64,
    pub merit: f64,
    pub payload: T,
}

struct BestRecord<T> {
    alpha: f64,
    merit: f64,
    payload: Option<T>,
    /// Which exponents have finished (either evaluated or failed).
    processed: Vec<bool>,
}

/// Evaluates the candidate schedule across the pool's workers and returns
/// the accepted step with the largest learning rate, or `None` when no
/// candidate beats the baseline merit.
///
/// `make_worker` builds the per-worker scratch (engines, provider clones)
/// once per thread; `evaluate` runs one candidate on that scratch. A
/// recoverable fault (divergence, cancellation) marks the candidate
/// infeasible; any other fault aborts the whole search.
pub fn search<W, T, M, E>(
    pool: &rayon::ThreadPool,
    schedule: &LineSearchSchedule,
    baseline_merit: f64,
    armijo_slope: f64,
    make_worker: M,
    evaluate: E,
) -> Result<Option<AcceptedStep<T>>, DdpError>
where
    W: Send,
    T: Send,
    M: Fn(usize) -> W + Sync,
    E: Fn(&mut W, f64, &CancellationToken) -> Result<(f64, T), DdpError> + Sync,
{
    let num_candidates = schedule.num_candidates();
    let next_exponent = AtomicUsize::new(0);
    let cancel = CancellationToken::new();
    let best = Mutex::new(BestRecord::<T> {
        alpha: 0.0,
        merit: baseline_merit,
        payload: None,
        processed: vec![false; num_candidates],
    });
    let fatal: Mutex<Option<DdpError>> = Mutex::new(None);

    pool.broadcast(|context| {
        let mut scratch = make_worker(context.index());
        loop {
            let exponent = next_exponent.fetch_add(1, Ordering::SeqCst);
            if exponent >= num_candidates {
                break;
            }
            let alpha = schedule.alpha(exponent);

            // A larger learning rate has already been accepted; under the
            // monotone acceptance rule no smaller one can beat it.
            {
                let best = best.lock().expect("line-search mutex poisoned");
                if alpha < best.alpha {
                    debug!(alpha, "skipping candidate: larger step already accepted");
                    break;
                }
            }

            let outcome = evaluate(&mut scratch, alpha, &cancel);
            let (merit, payload) = match outcome {
                Ok((merit, payload)) => (merit, Some(payload)),
                Err(error) if error.is_recoverable_in_line_search() => {
                    debug!(alpha, %error, "candidate rollout infeasible");
                    (f64::INFINITY, None)
                }
                Err(error) => {
                    let mut fatal = fatal.lock().expect("line-search mutex poisoned");
                    if fatal.is_none() {
                        *fatal = Some(error);
                    }
                    cancel.cancel();
                    break;
                }
            };

            let mut terminate = false;
            {
                let mut best = best.lock().expect("line-search mutex poisoned");
                let accepted = merit < baseline_merit * (1.0 - armijo_slope * alpha)
                    && alpha > best.alpha;
                if accepted {
                    if let Some(payload) = payload {
                        best.alpha = alpha;
                        best.merit = merit;
                        best.payload = Some(payload);
                        // All larger candidates resolved: nothing in flight
                        // can beat this step any more.
                        terminate = best.processed[..exponent].iter().all(|&done| done);
                    }
                }
                best.processed[exponent] = true;
            }
            if terminate {
                debug!(alpha, "interrupting inferior in-flight rollouts");
                cancel.cancel();
                break;
            }
        }
    });

    if let Some(error) = fatal.into_inner().expect("line-search mutex poisoned") {
        return Err(error);
    }
    let best = best.into_inner().expect("line-search mutex poisoned");
    let alpha = best.alpha;
    let merit = best.merit;
    Ok(best.payload.map(|payload| AcceptedStep {
        alpha,
        merit,
        payload,
    }))
}
