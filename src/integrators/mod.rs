//! Adaptive embedded Runge-Kutta-Fehlberg integration of pool systems.
//!
//! A month of one subsystem is integrated over the unit interval with
//! step-size control, under the constraint that no tracked pool may be
//! negative in any accepted state. See [`adaptive`] for the state machine.

pub mod adaptive;
pub mod bounds;
pub mod rkf45;
pub mod tableau;
pub mod workspace;

pub use adaptive::{AdaptiveIntegrator, IntegrationOutcome, Violation};
pub use bounds::{boundcon, check_pools, Verdict, BOUND_SLACK};
pub use rkf45::{rkf45_step, StageViolation};
pub use workspace::StepWorkspace;
