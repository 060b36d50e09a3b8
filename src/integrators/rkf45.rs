//! Single embedded RKF45 trial step.

use serde::{Deserialize, Serialize};

use super::bounds::check_pools;
use super::tableau::{A, STAGES, WEIGHTS_COMMITTED, WEIGHTS_EMBEDDED};
use super::workspace::StepWorkspace;
use crate::rhs::RhsProvider;

/// Stage number reported when the final committed estimate itself fails.
pub const FINAL_STAGE: usize = STAGES + 1;

/// A tentative state inside a trial step had a negative pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageViolation {
    /// 2..=6 for intra-step states, [`FINAL_STAGE`] for the committed estimate.
    pub stage: usize,
    pub index: usize,
    pub value: f64,
}

/// Run one RKF45 trial of length `dt` from `y`.
///
/// On success `ws.dum4` holds the committed estimate, `ws.dum5` the embedded
/// one and `ws.error` their absolute difference. On a stage violation the
/// trial stops immediately, `ws.dum4` is left equal to `y` and the remaining
/// stages are never evaluated.
pub fn rkf45_step(
    rhs: &dyn RhsProvider,
    y: &[f64],
    dt: f64,
    ws: &mut StepWorkspace,
) -> Result<(), StageViolation> {
    let layout = rhs.layout();
    let n = y.len();
    debug_assert_eq!(ws.len(), n, "workspace not sized to the active layout");

    ws.dum4.copy_from_slice(y);

    let StepWorkspace { k, ydum, .. } = ws;
    rhs.derivatives(y, &mut k[0]);

    for s in 1..STAGES {
        let row = &A[s];
        for i in 0..n {
            let mut acc = 0.0;
            for (j, kj) in k.iter().enumerate().take(s) {
                acc += row[j] * kj[i];
            }
            ydum[i] = y[i] + dt * acc;
        }
        if let Some(index) = check_pools(layout, ydum) {
            return Err(StageViolation { stage: s + 1, index, value: ydum[index] });
        }
        rhs.derivatives(ydum, &mut k[s]);
    }

    for i in 0..n {
        let mut a = 0.0;
        let mut b = 0.0;
        for s in 0..STAGES {
            a += WEIGHTS_COMMITTED[s] * ws.k[s][i];
            b += WEIGHTS_EMBEDDED[s] * ws.k[s][i];
        }
        ws.dum4[i] = y[i] + dt * a;
        ws.dum5[i] = y[i] + dt * b;
        ws.error[i] = (ws.dum4[i] - ws.dum5[i]).abs();
    }

    if let Some(index) = check_pools(layout, &ws.dum4) {
        let value = ws.dum4[index];
        ws.dum4.copy_from_slice(y);
        return Err(StageViolation { stage: FINAL_STAGE, index, value });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateLayout;
    use std::cell::Cell;

    /// dy/dt = -k y, with a flux slot accumulating the loss.
    struct Decay {
        layout: StateLayout,
        k: f64,
        calls: Cell<usize>,
    }

    impl RhsProvider for Decay {
        fn layout(&self) -> &StateLayout { &self.layout }
        fn derivatives(&self, y: &[f64], dydt: &mut [f64]) {
            self.calls.set(self.calls.get() + 1);
            dydt[0] = -self.k * y[0];
            dydt[1] = self.k * y[0];
        }
    }

    fn decay(k: f64) -> Decay {
        Decay { layout: StateLayout::custom(1, 1), k, calls: Cell::new(0) }
    }

    #[test]
    fn test_step_matches_exponential() {
        let rhs = decay(0.3);
        let mut ws = StepWorkspace::new(2);
        let y = [2.0, 0.0];
        rkf45_step(&rhs, &y, 0.5, &mut ws).unwrap();

        let exact = 2.0 * (-0.15f64).exp();
        assert!((ws.dum4[0] - exact).abs() < 1e-6, "got {}", ws.dum4[0]);
        assert!(ws.error[0] < 1e-6);
        // Flux slot mirrors the pool loss to roundoff.
        assert!((ws.dum4[0] + ws.dum4[1] - 2.0).abs() < 1e-12);
        assert_eq!(rhs.calls.get(), STAGES);
    }

    #[test]
    fn test_stage_violation_aborts_early() {
        // Second-stage state is 1 - 0.25 * 10 < 0.
        let rhs = decay(10.0);
        let mut ws = StepWorkspace::new(2);
        let y = [1.0, 0.0];
        let err = rkf45_step(&rhs, &y, 1.0, &mut ws).unwrap_err();
        assert_eq!(err.stage, 2);
        assert_eq!(err.index, 0);
        assert!(err.value < 0.0);
        assert_eq!(rhs.calls.get(), 1, "no derivative at an invalid state");
        assert_eq!(ws.dum4, y.to_vec(), "aborted trial leaves the start state");
    }

    #[test]
    fn test_negative_final_estimate_rejected() {
        // Drain of 1 on stages 1-4, a refill on stage 5: every stage state
        // stays positive, but the negative k5 weight pushes the committed
        // estimate to 1.2 - 1.4 < 0.
        struct Scripted {
            layout: StateLayout,
            calls: Cell<usize>,
        }
        impl RhsProvider for Scripted {
            fn layout(&self) -> &StateLayout { &self.layout }
            fn derivatives(&self, _y: &[f64], dydt: &mut [f64]) {
                let c = self.calls.get() + 1;
                self.calls.set(c);
                dydt[0] = match c {
                    1..=4 => -1.0,
                    5 => 1.0,
                    _ => 0.0,
                };
            }
        }
        let rhs = Scripted { layout: StateLayout::custom(1, 0), calls: Cell::new(0) };
        let mut ws = StepWorkspace::new(1);
        let err = rkf45_step(&rhs, &[1.2], 1.0, &mut ws).unwrap_err();
        assert_eq!(err.stage, FINAL_STAGE);
        assert!((err.value + 0.2).abs() < 1e-9, "got {}", err.value);
        assert_eq!(ws.dum4, vec![1.2]);
    }
}
