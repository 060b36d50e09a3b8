//! Non-negativity and relative-error checks.
//!
//! `check_pools` is the hard test run on every intra-step state; it looks at
//! tracked pools only. `boundcon` is the soft test run on a completed trial;
//! it looks at every tracked entry, pools and fluxes alike.

use serde::{Deserialize, Serialize};

use crate::state::StateLayout;

/// Absolute slack added to the relative tolerance test.
pub const BOUND_SLACK: f64 = 1e-10;

/// Outcome of [`boundcon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accept,
    /// Index of the first entry whose error exceeds tolerance.
    Reject(usize),
}

impl Verdict {
    #[inline]
    pub fn is_accept(self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// First tracked pool that is negative (or NaN) in `y`.
pub fn check_pools(layout: &StateLayout, y: &[f64]) -> Option<usize> {
    layout.tracked_pools().iter().copied().find(|&i| !(y[i] >= 0.0))
}

/// Relative error test over all tracked entries:
/// reject when `error[i] - |tol * candidate[i]| > 1e-10`.
pub fn boundcon(layout: &StateLayout, candidate: &[f64], error: &[f64], tol: f64) -> Verdict {
    for &i in layout.tracked() {
        let excess = error[i] - (tol * candidate[i]).abs();
        if !(excess <= BOUND_SLACK) {
            return Verdict::Reject(i);
        }
    }
    Verdict::Accept
}
