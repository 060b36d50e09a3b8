//! Right-hand-side contract shared by the vegetation and soil models.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state::StateLayout;

/// Which biogeochemical subsystem a layout or provider belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subsystem {
    Vegetation,
    Soil,
    /// Hand-built systems (tests, calibration probes).
    Custom,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::Vegetation => "vegetation",
            Subsystem::Soil => "soil",
            Subsystem::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Derivative function for one subsystem over one month.
///
/// Implementors hold a parameter snapshot frozen before integration begins
/// and must not change it from inside `derivatives`. Every entry of `dydt`
/// is overwritten on each call. Flux slots receive the instantaneous rate,
/// so after integrating over the unit month they hold monthly totals.
///
/// A provider never signals failure. When a tentative state would drive a
/// pool negative, the integrator's bound checks catch it.
pub trait RhsProvider {
    fn layout(&self) -> &StateLayout;

    fn derivatives(&self, y: &[f64], dydt: &mut [f64]);

    fn subsystem(&self) -> Subsystem {
        self.layout().subsystem()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant {
        layout: StateLayout,
        rate: f64,
    }

    impl RhsProvider for Constant {
        fn layout(&self) -> &StateLayout { &self.layout }
        fn derivatives(&self, _y: &[f64], dydt: &mut [f64]) {
            dydt.fill(self.rate);
        }
    }

    #[test]
    fn test_provider_behind_trait_object() {
        let p = Constant { layout: StateLayout::custom(1, 1), rate: 2.0 };
        let dynp: &dyn RhsProvider = &p;
        let mut out = vec![0.0; dynp.layout().len()];
        dynp.derivatives(&[1.0, 0.0], &mut out);
        assert_eq!(out, vec![2.0, 2.0]);
        assert_eq!(dynp.subsystem(), Subsystem::Custom);
        assert_eq!(Subsystem::Soil.to_string(), "soil");
    }
}
