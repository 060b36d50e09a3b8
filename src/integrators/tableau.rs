//! Runge-Kutta-Fehlberg 4(5) coefficients.
//!
//! Fehlberg, E. (1969). "Low-order classical Runge-Kutta formulas with
//! stepsize control and their application to some heat transfer problems",
//! NASA TR R-315, Table III.

/// Number of stage derivatives per step.
pub const STAGES: usize = 6;

/// Stage matrix, `A[s][j]` weighting `k_j` when forming the state at which
/// `k_s` is evaluated. Row 0 is unused (`k_1` is taken at the step start).
pub const A: [[f64; STAGES - 1]; STAGES] = [
    [0.0; 5],
    [1.0 / 4.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 32.0, 9.0 / 32.0, 0.0, 0.0, 0.0],
    [1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0, 0.0, 0.0],
    [439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0, 0.0],
    [-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0],
];

/// Weights of the estimate the driver commits. `k_2` and `k_6` carry zero weight.
pub const WEIGHTS_COMMITTED: [f64; STAGES] = [
    25.0 / 216.0,
    0.0,
    1408.0 / 2565.0,
    2197.0 / 4104.0,
    -1.0 / 5.0,
    0.0,
];

/// Weights of the embedded comparison estimate. `k_2` carries zero weight.
pub const WEIGHTS_EMBEDDED: [f64; STAGES] = [
    16.0 / 135.0,
    0.0,
    6656.0 / 12825.0,
    28561.0 / 56430.0,
    -9.0 / 50.0,
    2.0 / 55.0,
];
