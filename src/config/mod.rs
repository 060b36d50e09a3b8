// ============================================================================
// Run configuration
//
// IntegratorConfig carries the adaptive driver's three knobs (relative
// tolerance, halving floor exponent, forced-step cap). SimulationConfig
// wraps it with the N-cycle switches and the synthetic run size used by the
// driver binary. Both are plain serde structs with physical defaults.
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{BgcError, BgcResult};

/// Largest accepted `maxit`. Past 2^-60 the step no longer moves `t` in f64.
pub const MAXIT_LIMIT: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    /// Relative error tolerance for the post-step check [-]
    pub tolerance: f64,
    /// Halvings allowed before steps are force-accepted (dt floor = 0.5^maxit)
    pub maxit: u32,
    /// Forced steps allowed per month before the month is rolled back
    pub maxitmon: u32,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            maxit:     20,
            maxitmon:  100,
        }
    }
}

impl IntegratorConfig {
    pub fn validate(&self) -> BgcResult<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(BgcError::invalid_config(
                "tolerance", self.tolerance, "must be finite and non-negative",
            ));
        }
        if self.maxit == 0 || self.maxit > MAXIT_LIMIT {
            return Err(BgcError::invalid_config(
                "maxit", self.maxit as f64, "must lie in 1..=60",
            ));
        }
        if self.maxitmon == 0 {
            return Err(BgcError::invalid_config(
                "maxitmon", self.maxitmon as f64, "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Smallest trial step, 0.5^maxit.
    #[inline]
    pub fn min_step(&self) -> f64 {
        0.5f64.powi(self.maxit as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub integrator: IntegratorConfig,
    /// Plant-soil N feedback; when off, N pools are carried but not integrated
    pub nfeed:      bool,
    /// Open inorganic N cycle (leaching losses)
    pub avlnflg:    bool,
    /// Close the organic N budget against the soil C:N each month
    pub baseline:   bool,
    pub cohorts:    usize,
    pub years:      u32,
    pub seed:       u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            integrator: IntegratorConfig::default(),
            nfeed:      true,
            avlnflg:    false,
            baseline:   false,
            cohorts:    16,
            years:      10,
            seed:       42,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> BgcResult<()> {
        self.integrator.validate()?;
        if self.cohorts == 0 {
            return Err(BgcError::invalid_config("cohorts", 0.0, "must be at least 1"));
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> BgcResult<Self> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_string(&self) -> BgcResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = IntegratorConfig::default();
        assert_eq!(cfg.tolerance, 0.01);
        assert_eq!(cfg.maxit, 20);
        assert_eq!(cfg.maxitmon, 100);
        assert_eq!(cfg.min_step(), 1.0 / 1_048_576.0);
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad_tol = IntegratorConfig { tolerance: -0.1, ..Default::default() };
        assert!(bad_tol.validate().is_err());
        let nan_tol = IntegratorConfig { tolerance: f64::NAN, ..Default::default() };
        assert!(nan_tol.validate().is_err());
        let no_halving = IntegratorConfig { maxit: 0, ..Default::default() };
        assert!(no_halving.validate().is_err());
        let too_deep = IntegratorConfig { maxit: 61, ..Default::default() };
        assert!(too_deep.validate().is_err());
        let no_cap = IntegratorConfig { maxitmon: 0, ..Default::default() };
        assert!(no_cap.validate().is_err());

        // Zero tolerance is legal: every nonzero error then rejects.
        let strict = IntegratorConfig { tolerance: 0.0, ..Default::default() };
        assert!(strict.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip_and_partial_files() {
        let cfg = SimulationConfig { cohorts: 3, avlnflg: true, ..Default::default() };
        let text = cfg.to_json_string().unwrap();
        let back = SimulationConfig::from_json_str(&text).unwrap();
        assert_eq!(cfg, back);

        // Missing fields fall back to defaults.
        let partial = SimulationConfig::from_json_str(r#"{"integrator":{"tolerance":0.02}}"#).unwrap();
        assert_eq!(partial.integrator.tolerance, 0.02);
        assert_eq!(partial.integrator.maxit, 20);
        assert!(partial.nfeed);

        assert!(SimulationConfig::from_json_str(r#"{"cohorts":0}"#).is_err());
        assert!(SimulationConfig::from_json_str("not json").is_err());
    }
}
