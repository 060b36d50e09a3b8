//! Crate-wide error type.
//!
//! Integration itself never fails: stage violations, tolerance violations,
//! forced acceptance and black holes are reported through
//! [`crate::integrators::IntegrationOutcome`]. Errors here cover setup only
//! (configuration, profile geometry, vector/layout agreement, I/O of configs).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type BgcResult<T> = Result<T, BgcError>;

#[derive(Error, Debug)]
pub enum BgcError {
    /// A configuration field is outside its admissible range.
    #[error("invalid config: {field}={value} ({reason})")]
    InvalidConfig {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// A state vector does not have the length its layout requires.
    #[error("state vector length {found} does not match layout length {expected}")]
    LayoutMismatch { expected: usize, found: usize },

    /// Soil profile has more layers than the fixed key layout can hold.
    #[error("soil profile has {layers} layers, at most {max} supported")]
    ProfileTooDeep { layers: usize, max: usize },

    /// A soil layer breaks the profile geometry rules.
    #[error("soil layer {layer}: {reason}")]
    InvalidProfile { layer: usize, reason: &'static str },

    /// Monthly soil climate does not cover every profile layer.
    #[error("soil climate has {found} layers, profile has {expected}")]
    ClimateMismatch { expected: usize, found: usize },

    #[error("config serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BgcError {
    pub fn invalid_config(field: &'static str, value: f64, reason: &'static str) -> Self {
        Self::InvalidConfig { field, value, reason }
    }

    pub fn invalid_profile(layer: usize, reason: &'static str) -> Self {
        Self::InvalidProfile { layer, reason }
    }

    pub fn layout_mismatch(expected: usize, found: usize) -> Self {
        Self::LayoutMismatch { expected, found }
    }
}
