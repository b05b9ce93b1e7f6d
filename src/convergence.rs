//! Decides whether another Fix/Test iteration is worth running.

pub const DEFAULT_STAGNATION_WINDOW: usize = 3;
pub const DEFAULT_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergencePolicy {
    /// Number of trailing quality scores inspected for stagnation.
    pub stagnation_window: usize,
    /// Scores closer than this are considered unchanged.
    pub epsilon: f64,
}

impl Default for ConvergencePolicy {
    fn default() -> Self {
        Self {
            stagnation_window: DEFAULT_STAGNATION_WINDOW,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxIterations,
    Stagnation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Stop(StopReason),
}

impl Decision {
    pub fn should_continue(self) -> bool {
        self == Decision::Continue
    }

    pub fn stop_reason(self) -> Option<StopReason> {
        match self {
            Decision::Continue => None,
            Decision::Stop(reason) => Some(reason),
        }
    }
}

/// Budget exhaustion wins over everything; otherwise stop when the last
/// `stagnation_window` scores all lie within `epsilon` of each other.
pub fn should_continue(
    quality_history: &[f64],
    iteration: u32,
    max_iterations: u32,
    policy: &ConvergencePolicy,
) -> Decision {
    if iteration >= max_iterations {
        return Decision::Stop(StopReason::MaxIterations);
    }
    if is_stagnant(quality_history, policy) {
        return Decision::Stop(StopReason::Stagnation);
    }
    Decision::Continue
}

fn is_stagnant(history: &[f64], policy: &ConvergencePolicy) -> bool {
    let k = policy.stagnation_window;
    if k == 0 || history.len() < k {
        return false;
    }
    let window = &history[history.len() - k..];
    if !window.iter().all(|s| s.is_finite()) {
        return false;
    }
    // All pairwise differences are below epsilon iff the spread is.
    let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = window.iter().copied().fold(f64::INFINITY, f64::min);
    max - min < policy.epsilon
}
