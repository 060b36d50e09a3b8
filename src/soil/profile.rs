//! Soil column geometry and the monthly soil climate that drives it.

use serde::{Deserialize, Serialize};

use crate::error::{BgcError, BgcResult};
use crate::state::{MAX_DEP_LAY, MAX_MIN_LAY, MAX_MOS_LAY, MAX_SHL_LAY, MAX_SOI_LAY};

/// Horizon type, ordered from the surface down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Moss,
    /// Fibric organic horizon
    Shallow,
    /// Humic organic horizon
    Deep,
    Mineral,
}

impl LayerKind {
    fn max_layers(self) -> usize {
        match self {
            LayerKind::Moss => MAX_MOS_LAY,
            LayerKind::Shallow => MAX_SHL_LAY,
            LayerKind::Deep => MAX_DEP_LAY,
            LayerKind::Mineral => MAX_MIN_LAY,
        }
    }

    /// Moss and fibric horizons, whose resistant SOM production moves down.
    #[inline]
    pub fn is_fibric(self) -> bool {
        matches!(self, LayerKind::Moss | LayerKind::Shallow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoilLayer {
    pub kind:     LayerKind,
    /// Depth of the layer top [m]
    pub z:        f64,
    /// Thickness [m]
    pub dz:       f64,
    /// Share of fine roots in this layer
    pub rootfrac: f64,
}

/// Validated, top-down list of live layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilProfile {
    layers: Vec<SoilLayer>,
}

impl SoilProfile {
    /// Build a profile from `(kind, dz, rootfrac)` rows. Layer tops are
    /// accumulated from the thicknesses and root fractions are normalized.
    pub fn from_layers(rows: &[(LayerKind, f64, f64)]) -> BgcResult<Self> {
        let mut z = 0.0;
        let mut layers = Vec::with_capacity(rows.len());
        for &(kind, dz, rootfrac) in rows {
            layers.push(SoilLayer { kind, z, dz, rootfrac });
            z += dz;
        }
        let total_root: f64 = layers.iter().map(|l| l.rootfrac.max(0.0)).sum();
        if total_root > 0.0 {
            for l in &mut layers {
                l.rootfrac /= total_root;
            }
        }
        let profile = Self { layers };
        profile.validate()?;
        Ok(profile)
    }

    /// Boreal black spruce peat over silt.
    pub fn boreal_peat() -> Self {
        use LayerKind::*;
        let rows = [
            (Moss, 0.02, 0.0),
            (Moss, 0.04, 0.0),
            (Shallow, 0.05, 0.30),
            (Shallow, 0.10, 0.25),
            (Deep, 0.10, 0.20),
            (Deep, 0.15, 0.10),
            (Mineral, 0.10, 0.08),
            (Mineral, 0.20, 0.05),
            (Mineral, 0.30, 0.02),
            (Mineral, 0.50, 0.0),
            (Mineral, 1.00, 0.0),
        ];
        let mut z = 0.0;
        let layers = rows.iter().map(|&(kind, dz, rootfrac)| {
            let l = SoilLayer { kind, z, dz, rootfrac };
            z += dz;
            l
        }).collect();
        Self { layers }
    }

    pub fn validate(&self) -> BgcResult<()> {
        let n = self.layers.len();
        if n > MAX_SOI_LAY {
            return Err(BgcError::ProfileTooDeep { layers: n, max: MAX_SOI_LAY });
        }
        if n == 0 {
            return Err(BgcError::invalid_profile(0, "profile has no layers"));
        }

        let mut count = [0usize; 4];
        let mut rootsum = 0.0;
        for (i, l) in self.layers.iter().enumerate() {
            if !(l.dz.is_finite() && l.dz > 0.0) {
                return Err(BgcError::invalid_profile(i, "thickness must be positive"));
            }
            if !(l.rootfrac >= 0.0) {
                return Err(BgcError::invalid_profile(i, "root fraction must be non-negative"));
            }
            if i > 0 && l.kind < self.layers[i - 1].kind {
                return Err(BgcError::invalid_profile(i, "horizons out of order"));
            }
            let c = &mut count[l.kind as usize];
            *c += 1;
            if *c > l.kind.max_layers() {
                return Err(BgcError::invalid_profile(i, "too many layers of this horizon"));
            }
            rootsum += l.rootfrac;
        }
        if rootsum > 0.0 && (rootsum - 1.0).abs() > 1e-6 {
            return Err(BgcError::invalid_profile(n - 1, "root fractions do not sum to one"));
        }
        Ok(())
    }

    #[inline] pub fn numsl(&self) -> usize { self.layers.len() }
    #[inline] pub fn layers(&self) -> &[SoilLayer] { &self.layers }
    #[inline] pub fn layer(&self, il: usize) -> &SoilLayer { &self.layers[il] }

    fn thickness_of(&self, kind: LayerKind) -> f64 {
        self.layers.iter().filter(|l| l.kind == kind).map(|l| l.dz).sum()
    }

    pub fn deepthick(&self) -> f64 { self.thickness_of(LayerKind::Deep) }
    pub fn mineralthick(&self) -> f64 { self.thickness_of(LayerKind::Mineral) }

    pub fn has_mineral(&self) -> bool {
        self.layers.iter().any(|l| l.kind == LayerKind::Mineral)
    }

    /// First layer below the moss; the last layer if everything is moss.
    pub fn first_non_moss(&self) -> usize {
        self.layers.iter()
            .position(|l| l.kind != LayerKind::Moss)
            .unwrap_or(self.layers.len().saturating_sub(1))
    }

    /// Layer receiving dead-moss decomposition products: the lowest moss
    /// layer, or the surface layer when there is no moss.
    pub fn moss_sink(&self) -> usize {
        self.layers.iter().rposition(|l| l.kind == LayerKind::Moss).unwrap_or(0)
    }

    /// Share of layer `il` lying above `depth`.
    pub fn fraction_above(&self, il: usize, depth: f64) -> f64 {
        let l = &self.layers[il];
        ((depth - l.z) / l.dz).clamp(0.0, 1.0)
    }
}

impl Default for SoilProfile {
    fn default() -> Self { Self::boreal_peat() }
}

/// Monthly soil physical state, one entry per profile layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilClimate {
    /// Layer temperature [°C]
    pub ts:         Vec<f64>,
    /// Saturation fraction [0, 1]
    pub sws:        Vec<f64>,
    /// Liquid water [mm]
    pub liq:        Vec<f64>,
    /// Bottom of the drained zone [m]
    pub draindepth: f64,
    /// Drainage and surface runoff [mm/month]
    pub qdrain:     f64,
    pub qover:      f64,
}

impl SoilClimate {
    /// Same conditions in every layer; liquid water scales with thickness.
    pub fn uniform(profile: &SoilProfile, ts: f64, sws: f64) -> Self {
        let n = profile.numsl();
        Self {
            ts: vec![ts; n],
            sws: vec![sws; n],
            liq: profile.layers().iter().map(|l| if ts > 0.0 { sws * l.dz * 1000.0 } else { 0.0 }).collect(),
            draindepth: 0.0,
            qdrain: 0.0,
            qover: 0.0,
        }
    }

    pub fn ensure_covers(&self, numsl: usize) -> BgcResult<()> {
        let found = self.ts.len().min(self.sws.len()).min(self.liq.len());
        if found < numsl {
            return Err(BgcError::ClimateMismatch { expected: numsl, found });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_profile_is_valid() {
        let p = SoilProfile::boreal_peat();
        p.validate().unwrap();
        assert_eq!(p.numsl(), 11);
        assert_eq!(p.first_non_moss(), 2);
        assert_eq!(p.moss_sink(), 1);
        assert!((p.deepthick() - 0.25).abs() < 1e-12);
        assert!((p.mineralthick() - 2.1).abs() < 1e-12);
        assert!((p.layer(4).z - 0.21).abs() < 1e-12);
        let roots: f64 = p.layers().iter().map(|l| l.rootfrac).sum();
        assert!((roots - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_validation_rejects_bad_geometry() {
        use LayerKind::*;
        assert!(SoilProfile::from_layers(&[]).is_err());
        assert!(SoilProfile::from_layers(&[(Shallow, 0.0, 1.0)]).is_err());
        assert!(SoilProfile::from_layers(&[(Mineral, 0.1, 1.0), (Deep, 0.1, 0.0)]).is_err());
        assert!(SoilProfile::from_layers(&[(Moss, 0.01, 0.0); 3]).is_err());

        let too_deep = vec![(Mineral, 0.1, 0.0); MAX_SOI_LAY + 1];
        match SoilProfile::from_layers(&too_deep) {
            Err(BgcError::ProfileTooDeep { layers, .. }) => assert_eq!(layers, MAX_SOI_LAY + 1),
            other => panic!("expected ProfileTooDeep, got {other:?}"),
        }
    }

    #[test]
    fn test_root_fractions_normalized() {
        use LayerKind::*;
        let p = SoilProfile::from_layers(&[(Shallow, 0.1, 2.0), (Mineral, 0.2, 6.0)]).unwrap();
        assert!((p.layer(0).rootfrac - 0.25).abs() < 1e-12);
        assert_eq!(p.moss_sink(), 0, "no moss: surface layer receives moss products");
        assert!((p.layer(1).z - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_fraction_above_drain_depth() {
        let p = SoilProfile::boreal_peat();
        // Layer 2 spans 0.06..0.11.
        assert_eq!(p.fraction_above(2, 0.2), 1.0);
        assert!((p.fraction_above(2, 0.085) - 0.5).abs() < 1e-12);
        assert_eq!(p.fraction_above(2, 0.03), 0.0);
    }

    #[test]
    fn test_climate_must_cover_profile() {
        let p = SoilProfile::boreal_peat();
        let mut c = SoilClimate::uniform(&p, 5.0, 0.6);
        c.ensure_covers(p.numsl()).unwrap();
        c.liq.pop();
        assert!(matches!(c.ensure_covers(p.numsl()), Err(BgcError::ClimateMismatch { .. })));
    }
}
