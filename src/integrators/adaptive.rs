// ============================================================================
// Adaptive month driver
//
// Walks t from 0 to 1 (one calendar month) with RKF45 trials:
//
//   trial ── stage violation ──────────┐
//     │                                ├─► reject: dt /= 2, retry from y
//     └── boundcon Reject(i) ──────────┘
//     └── boundcon Accept ─────────────► accept: y = dum4, t += dt, maybe dt *= 2
//
//   dt <= 0.5^maxit                     ► forced accept (first one snapshots y)
//   forced steps == maxitmon            ► black hole: y = snapshot, t = 1
//
// Nothing here fails: every month produces a usable state and the outcome
// says how much to trust it.
// ============================================================================

use log::debug;
use serde::{Deserialize, Serialize};

use super::bounds::{boundcon, Verdict};
use super::rkf45::{rkf45_step, StageViolation};
use super::workspace::StepWorkspace;
use crate::config::IntegratorConfig;
use crate::error::BgcResult;
use crate::rhs::RhsProvider;
use crate::state::{StateLayout, StateVector};

/// Why a trial was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Violation {
    /// A pool went negative inside the trial.
    Stage(StageViolation),
    /// Local error exceeded tolerance at this entry.
    Tolerance { index: usize },
}

impl Violation {
    pub fn index(&self) -> usize {
        match self {
            Violation::Stage(v) => v.index,
            Violation::Tolerance { index } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationOutcome {
    /// At least one step was committed at the dt floor.
    pub forced: bool,
    /// Forced-step cap reached; the state was rolled back.
    pub blackhole: bool,
    pub accepted_steps: u32,
    pub rejected_steps: u32,
    pub stage_violations: u32,
    pub tolerance_violations: u32,
    /// Forced steps taken (the month's `nintmon`).
    pub forced_steps: u32,
    pub min_dt: f64,
    pub max_dt: f64,
    pub last_violation: Option<Violation>,
}

impl Default for IntegrationOutcome {
    fn default() -> Self {
        Self {
            forced: false,
            blackhole: false,
            accepted_steps: 0,
            rejected_steps: 0,
            stage_violations: 0,
            tolerance_violations: 0,
            forced_steps: 0,
            min_dt: 1.0,
            max_dt: 0.0,
            last_violation: None,
        }
    }
}

impl IntegrationOutcome {
    /// 0 for a clean month, 1 when any step was forced.
    pub fn convergence_flag(&self) -> u8 {
        u8::from(self.forced)
    }

    pub fn is_clean(&self) -> bool {
        !self.forced && !self.blackhole
    }
}

/// Adaptive RKF45 driver bound to one subsystem's vector length.
#[derive(Debug, Clone)]
pub struct AdaptiveIntegrator {
    config: IntegratorConfig,
    ws: StepWorkspace,
}

impl AdaptiveIntegrator {
    pub fn new(config: IntegratorConfig, layout: &StateLayout) -> BgcResult<Self> {
        config.validate()?;
        Ok(Self { config, ws: StepWorkspace::new(layout.len()) })
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    pub fn workspace(&self) -> &StepWorkspace {
        &self.ws
    }

    /// Integrate `state` over one month after checking it fits the provider's layout.
    pub fn integrate_one_month(
        &mut self,
        rhs: &dyn RhsProvider,
        state: &mut StateVector,
    ) -> BgcResult<IntegrationOutcome> {
        state.ensure_matches(rhs.layout())?;
        Ok(self.adapt(rhs, state))
    }

    /// Advance `y` from t = 0 to t = 1.
    pub fn adapt(&mut self, rhs: &dyn RhsProvider, y: &mut [f64]) -> IntegrationOutcome {
        self.ws.ensure_len(y.len());
        let layout = rhs.layout();
        let tol = self.config.tolerance;
        let dt_floor = self.config.min_step();

        let mut out = IntegrationOutcome::default();
        let mut t = 0.0f64;
        let mut dt = 1.0f64;
        let mut nintmon = 0u32;

        while t < 1.0 {
            out.min_dt = out.min_dt.min(dt);
            out.max_dt = out.max_dt.max(dt);

            let verdict = match rkf45_step(rhs, y, dt, &mut self.ws) {
                Ok(()) => match boundcon(layout, &self.ws.dum4, &self.ws.error, tol) {
                    Verdict::Accept => None,
                    Verdict::Reject(index) => {
                        out.tolerance_violations += 1;
                        Some(Violation::Tolerance { index })
                    }
                },
                Err(v) => {
                    out.stage_violations += 1;
                    Some(Violation::Stage(v))
                }
            };

            let mut accept = verdict.is_none();
            if let Some(v) = verdict {
                debug!(
                    "{} trial rejected at t={t:.6} dt={dt:.3e}: entry {} ({v:?})",
                    rhs.subsystem(), v.index(),
                );
                out.last_violation = Some(v);
            }

            if dt <= dt_floor {
                accept = true;
                out.forced = true;
                if nintmon == 0 {
                    self.ws.snapshot.copy_from_slice(y);
                }
                nintmon += 1;
            }

            if accept {
                y.copy_from_slice(&self.ws.dum4);
                out.accepted_steps += 1;
                t += dt;
                let fpart = (0.01 + t / (2.0 * dt)).fract();
                if fpart < 0.1 && dt < 1.0 {
                    dt *= 2.0;
                }
            } else {
                out.rejected_steps += 1;
                dt *= 0.5;
            }

            if nintmon == self.config.maxitmon {
                y.copy_from_slice(&self.ws.snapshot);
                out.blackhole = true;
                t = 1.0;
            }
        }

        out.forced_steps = nintmon;
        out
    }
}
