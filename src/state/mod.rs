//! Flat state vectors and their fixed key layouts.
//!
//! Each biogeochemical subsystem is integrated as one `Vec<f64>` whose
//! offsets are fixed at compile time: standing pools first, then per-step
//! flux slots. The vegetation layout holds one plant functional type's three
//! tissues; the soil layout holds up to [`MAX_SOI_LAY`] layers, of which only
//! the first `numsl` are live for a given profile.

use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

use crate::error::{BgcError, BgcResult};
use crate::rhs::Subsystem;

// ---------------------------------------------------------------------------
// Size constants
// ---------------------------------------------------------------------------

pub const NUM_PFT_PART: usize = 3;
pub const I_LEAF: usize = 0;
pub const I_STEM: usize = 1;
pub const I_ROOT: usize = 2;

pub const MAX_MOS_LAY: usize = 2;
pub const MAX_SHL_LAY: usize = 3;
pub const MAX_DEP_LAY: usize = 3;
pub const MAX_MIN_LAY: usize = 15;
pub const MAX_SOI_LAY: usize = MAX_MOS_LAY + MAX_SHL_LAY + MAX_DEP_LAY + MAX_MIN_LAY;

pub const NUM_VEG_STATE: usize = 2 * NUM_PFT_PART + 3;
pub const NUM_VEG_FLUX: usize = 11 * NUM_PFT_PART + 2;
pub const NUMEQ_VEG: usize = NUM_VEG_STATE + NUM_VEG_FLUX;

pub const NUM_SOI_STATE: usize = 6 * MAX_SOI_LAY + 4;
pub const NUM_SOI_FLUX: usize = 6 * MAX_SOI_LAY + 4;
pub const NUMEQ_SOI: usize = NUM_SOI_STATE + NUM_SOI_FLUX;

/// Vegetation keys. Tissue blocks are indexed `KEY + tissue`.
pub mod veg {
    use super::NUM_PFT_PART as P;

    pub const VEGC: usize = 0;
    pub const STRN: usize = VEGC + P;
    pub const LABN: usize = STRN + P;
    pub const DEADC: usize = LABN + 1;
    pub const DEADN: usize = DEADC + 1;

    pub const INGPP: usize = DEADN + 1;
    pub const INNPP: usize = INGPP + P;
    pub const GPP: usize = INNPP + P;
    pub const NPP: usize = GPP + P;
    pub const RM: usize = NPP + P;
    pub const RG: usize = RM + P;
    pub const LTRC: usize = RG + P;
    pub const SNUP: usize = LTRC + P;
    pub const NMBOL: usize = SNUP + P;
    pub const NRSRB: usize = NMBOL + P;
    pub const LTRN: usize = NRSRB + P;
    pub const INNUP: usize = LTRN + P;
    pub const LNUP: usize = INNUP + 1;
}

/// Soil keys. Layer blocks are indexed `KEY + layer`.
pub mod soi {
    use super::MAX_SOI_LAY as L;

    pub const RAWC: usize = 0;
    pub const SOMA: usize = RAWC + L;
    pub const SOMPR: usize = SOMA + L;
    pub const SOMCR: usize = SOMPR + L;
    pub const ORGN: usize = SOMCR + L;
    pub const AVLN: usize = ORGN + L;
    pub const WDEBRISC: usize = AVLN + L;
    pub const WDEBRISN: usize = WDEBRISC + 1;
    pub const DMOSSC: usize = WDEBRISN + 1;
    pub const DMOSSN: usize = DMOSSC + 1;

    pub const RH_RAW: usize = DMOSSN + 1;
    pub const RH_SOMA: usize = RH_RAW + L;
    pub const RH_SOMPR: usize = RH_SOMA + L;
    pub const RH_SOMCR: usize = RH_SOMPR + L;
    pub const NMIN: usize = RH_SOMCR + L;
    pub const NIMMOB: usize = NMIN + L;
    pub const RH_WD: usize = NIMMOB + L;
    pub const RH_DMOSS: usize = RH_WD + 1;
    pub const ORGNLOSS: usize = RH_DMOSS + 1;
    pub const AVLNLOSS: usize = ORGNLOSS + 1;
}

const _: () = assert!(veg::INGPP == NUM_VEG_STATE);
const _: () = assert!(veg::LNUP + 1 == NUMEQ_VEG);
const _: () = assert!(soi::RH_RAW == NUM_SOI_STATE);
const _: () = assert!(soi::AVLNLOSS + 1 == NUMEQ_SOI);

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// How the bound checks treat one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Standing stock: must stay non-negative, error-checked.
    Pool,
    /// Per-step flux slot: error-checked only.
    Flux,
    /// Integrated but ignored by both checks (inactive layers, N with nfeed off).
    Untracked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLayout {
    subsystem: Subsystem,
    kinds: Vec<EntryKind>,
    /// Tracked pool indices, in key order.
    pools: Vec<usize>,
    /// Tracked pool and flux indices, in key order.
    tracked: Vec<usize>,
}

impl StateLayout {
    fn from_kinds(subsystem: Subsystem, kinds: Vec<EntryKind>) -> Self {
        let pools = kinds.iter().enumerate()
            .filter(|(_, k)| **k == EntryKind::Pool)
            .map(|(i, _)| i)
            .collect();
        let tracked = kinds.iter().enumerate()
            .filter(|(_, k)| **k != EntryKind::Untracked)
            .map(|(i, _)| i)
            .collect();
        Self { subsystem, kinds, pools, tracked }
    }

    /// Vegetation layout for one PFT. With `nfeed` off the N pools and N
    /// fluxes are untracked.
    pub fn vegetation(nfeed: bool) -> Self {
        use veg::*;
        let n_kind = |k| if nfeed { k } else { EntryKind::Untracked };
        let mut kinds = vec![EntryKind::Untracked; NUMEQ_VEG];

        for i in 0..NUM_PFT_PART {
            kinds[VEGC + i] = EntryKind::Pool;
            kinds[STRN + i] = n_kind(EntryKind::Pool);
            for key in [INGPP, INNPP, GPP, NPP, RM, RG, LTRC] {
                kinds[key + i] = EntryKind::Flux;
            }
            for key in [SNUP, NMBOL, NRSRB, LTRN] {
                kinds[key + i] = n_kind(EntryKind::Flux);
            }
        }
        kinds[LABN] = n_kind(EntryKind::Pool);
        kinds[DEADC] = EntryKind::Pool;
        kinds[DEADN] = n_kind(EntryKind::Pool);
        kinds[INNUP] = n_kind(EntryKind::Flux);
        kinds[LNUP] = n_kind(EntryKind::Flux);

        Self::from_kinds(Subsystem::Vegetation, kinds)
    }

    /// Soil layout with `numsl` live layers.
    pub fn soil(numsl: usize, nfeed: bool) -> BgcResult<Self> {
        use soi::*;
        if numsl > MAX_SOI_LAY {
            return Err(BgcError::ProfileTooDeep { layers: numsl, max: MAX_SOI_LAY });
        }
        let n_kind = |k| if nfeed { k } else { EntryKind::Untracked };
        let mut kinds = vec![EntryKind::Untracked; NUMEQ_SOI];

        for il in 0..numsl {
            for key in [RAWC, SOMA, SOMPR, SOMCR] {
                kinds[key + il] = EntryKind::Pool;
            }
            kinds[ORGN + il] = n_kind(EntryKind::Pool);
            kinds[AVLN + il] = n_kind(EntryKind::Pool);
            for key in [RH_RAW, RH_SOMA, RH_SOMPR, RH_SOMCR] {
                kinds[key + il] = EntryKind::Flux;
            }
            kinds[NMIN + il] = n_kind(EntryKind::Flux);
            kinds[NIMMOB + il] = n_kind(EntryKind::Flux);
        }
        kinds[WDEBRISC] = EntryKind::Pool;
        kinds[DMOSSC] = EntryKind::Pool;
        kinds[WDEBRISN] = n_kind(EntryKind::Pool);
        kinds[DMOSSN] = n_kind(EntryKind::Pool);
        kinds[RH_WD] = EntryKind::Flux;
        kinds[RH_DMOSS] = EntryKind::Flux;
        kinds[ORGNLOSS] = n_kind(EntryKind::Flux);
        kinds[AVLNLOSS] = n_kind(EntryKind::Flux);

        Ok(Self::from_kinds(Subsystem::Soil, kinds))
    }

    /// `pools` tracked pools followed by `fluxes` tracked flux slots.
    pub fn custom(pools: usize, fluxes: usize) -> Self {
        let mut kinds = vec![EntryKind::Pool; pools];
        kinds.extend(std::iter::repeat(EntryKind::Flux).take(fluxes));
        Self::from_kinds(Subsystem::Custom, kinds)
    }

    #[inline] pub fn len(&self) -> usize { self.kinds.len() }
    #[inline] pub fn is_empty(&self) -> bool { self.kinds.is_empty() }
    #[inline] pub fn subsystem(&self) -> Subsystem { self.subsystem }
    #[inline] pub fn kind(&self, i: usize) -> EntryKind { self.kinds[i] }
    #[inline] pub fn is_pool(&self, i: usize) -> bool { self.kinds[i] == EntryKind::Pool }
    #[inline] pub fn is_tracked(&self, i: usize) -> bool { self.kinds[i] != EntryKind::Untracked }
    #[inline] pub fn tracked_pools(&self) -> &[usize] { &self.pools }
    #[inline] pub fn tracked(&self) -> &[usize] { &self.tracked }
}

// ---------------------------------------------------------------------------
// StateVector
// ---------------------------------------------------------------------------

/// One subsystem's integrated values for one cohort-month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    values: Vec<f64>,
}

impl StateVector {
    pub fn zeros(layout: &StateLayout) -> Self {
        Self { values: vec![0.0; layout.len()] }
    }

    pub fn from_vec(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Zero every entry, keeping the allocation.
    pub fn clear(&mut self) {
        self.values.fill(0.0);
    }

    pub fn matches(&self, layout: &StateLayout) -> bool {
        self.values.len() == layout.len()
    }

    pub fn ensure_matches(&self, layout: &StateLayout) -> BgcResult<()> {
        if self.matches(layout) {
            Ok(())
        } else {
            Err(BgcError::layout_mismatch(layout.len(), self.values.len()))
        }
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.values
    }
}

impl Deref for StateVector {
    type Target = [f64];
    fn deref(&self) -> &[f64] { &self.values }
}

impl DerefMut for StateVector {
    fn deref_mut(&mut self) -> &mut [f64] { &mut self.values }
}

// ---------------------------------------------------------------------------
// Unmarshal clipping
// ---------------------------------------------------------------------------

/// Floor written into an inorganic/labile N pool that came back negative.
pub const CLIP_FLOOR: f64 = 0.001;

/// What negative-residual clipping did while reading a vector back.
///
/// Small negative N pools are reset to [`CLIP_FLOOR`] and the deficit is
/// borrowed from a companion pool. This does not conserve the clipped pool
/// exactly; the report keeps the correction visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipReport {
    pub clipped: u32,
    /// Total N moved out of companion pools [gN/m²].
    pub deficit: f64,
}

impl ClipReport {
    /// Clip `pool` against `companion` if it is negative.
    pub fn apply(&mut self, pool: &mut f64, companion: &mut f64) {
        if *pool < 0.0 {
            let borrowed = CLIP_FLOOR - *pool;
            *companion -= borrowed;
            *pool = CLIP_FLOOR;
            self.clipped += 1;
            self.deficit += borrowed;
        }
    }

    pub fn merge(&mut self, other: ClipReport) {
        self.clipped += other.clipped;
        self.deficit += other.deficit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_borrows_from_companion() {
        let mut report = ClipReport::default();
        let mut labn = -0.004;
        let mut strn = 2.0;
        report.apply(&mut labn, &mut strn);
        assert_eq!(labn, CLIP_FLOOR);
        assert!((strn - (2.0 - 0.005)).abs() < 1e-15);
        assert_eq!(report.clipped, 1);
        assert!((report.deficit - 0.005).abs() < 1e-15);

        let mut fine = 0.5;
        report.apply(&mut fine, &mut strn);
        assert_eq!(fine, 0.5);
        assert_eq!(report.clipped, 1);
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(MAX_SOI_LAY, 23);
        assert_eq!(NUMEQ_VEG, 44);
        assert_eq!(NUMEQ_SOI, 284);
        assert_eq!(veg::INNUP, 42);
        assert_eq!(veg::LNUP, 43);
        assert_eq!(soi::WDEBRISC, 138);
        assert_eq!(soi::AVLNLOSS, 283);
    }

    #[test]
    fn test_vegetation_tracking_follows_nfeed() {
        let with_n = StateLayout::vegetation(true);
        let without_n = StateLayout::vegetation(false);
        assert_eq!(with_n.len(), NUMEQ_VEG);
        assert!(with_n.is_pool(veg::LABN));
        assert!(!without_n.is_tracked(veg::LABN));
        assert!(without_n.is_pool(veg::VEGC + I_ROOT));
        assert_eq!(with_n.tracked_pools().len(), NUM_VEG_STATE);
        assert_eq!(with_n.tracked().len(), NUMEQ_VEG);
        assert!(without_n.tracked().len() < with_n.tracked().len());
        assert_eq!(with_n.kind(veg::GPP), EntryKind::Flux);
    }

    #[test]
    fn test_soil_inactive_layers_untracked() {
        let layout = StateLayout::soil(5, true).unwrap();
        assert_eq!(layout.len(), NUMEQ_SOI);
        assert!(layout.is_pool(soi::SOMA + 4));
        assert!(!layout.is_tracked(soi::SOMA + 5));
        assert!(!layout.is_tracked(soi::RH_RAW + 22));
        assert!(layout.is_pool(soi::DMOSSC));
        assert_eq!(layout.tracked_pools().len(), 6 * 5 + 4);

        assert!(StateLayout::soil(MAX_SOI_LAY + 1, true).is_err());
    }

    #[test]
    fn test_state_vector_matches_layout() {
        let layout = StateLayout::custom(2, 1);
        let mut y = StateVector::zeros(&layout);
        assert!(y.matches(&layout));
        y[1] = 4.0;
        assert_eq!(y.iter().sum::<f64>(), 4.0);
        y.clear();
        assert_eq!(y[1], 0.0);

        let short = StateVector::from_vec(vec![0.0; 2]);
        assert!(short.ensure_matches(&layout).is_err());
    }
}
