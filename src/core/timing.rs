use std::time::{Duration, Instant};

/// Accumulates wall-clock time for one solver phase across iterations.
#[derive(Debug, Default)]
pub struct PhaseTimer {
    total: Duration,
    count: u32,
    started: Option<Instant>,
}

impl PhaseTimer {
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
            self.count += 1;
        }
    }

    pub fn total_ms(&self) -> f64 {
        self.total.as_secs_f64() * 1e3
    }

    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms() / (self.count as f64)
        }
    }

    pub fn reset(&mut self) {
        *self = PhaseTimer::default();
    }
}

/// One timer per solver phase, reported as a summary after a solve.
#[derive(Debug, Default)]
pub struct BenchmarkTimers {
    pub forward_pass: PhaseTimer,
    pub lq_approximation: PhaseTimer,
    pub backward_pass: PhaseTimer,
    pub controller: PhaseTimer,
    pub line_search: PhaseTimer,
}

impl BenchmarkTimers {
    pub fn reset(&mut self) {
        self.forward_pass.reset();
        self.lq_approximation.reset();
        self.backward_pass.reset();
        self.controller.reset();
        self.line_search.reset();
    }

    /// Average time per phase and its share of the total, one line per phase.
    pub fn summary(&self) -> String {
        let entries = [
            ("forward pass", &self.forward_pass),
            ("LQ approximation", &self.lq_approximation),
            ("backward pass", &self.backward_pass),
            ("controller", &self.controller),
            ("line search", &self.line_search),
        ];
        let total: f64 = entries.iter().map(|(_, t)| t.total_ms()).sum();
        let mut lines = Vec::with_capacity(entries.len());
        for (name, timer) in &entries {
            let share = if total > 0.0 {
                100.0 * timer.total_ms() / total
            } else {
                0.0
            };
            lines.push(format!(
                "{:<17}: {:8.3} ms avg ({:5.1}% of total)",
                name,
                timer.average_ms(),
                share
            ));
        }
        lines.join("\n")
    }
}
