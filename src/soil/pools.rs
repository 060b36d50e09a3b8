use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::soil::profile::{LayerKind, SoilClimate, SoilProfile};
use crate::state::{soi, ClipReport, StateVector};

/// Months of litterfall C:N kept for the decomposition-rate adjustment.
pub const LITTER_CN_MONTHS: usize = 12;

// ---------------------------------------------------------------------------
// Domain model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoilState {
    /// Raw litter C per layer [gC/m²]
    pub rawc:     Vec<f64>,
    /// Active, physically resistant and chemically resistant SOM C [gC/m²]
    pub soma:     Vec<f64>,
    pub sompr:    Vec<f64>,
    pub somcr:    Vec<f64>,
    /// Organic and available inorganic N [gN/m²]
    pub orgn:     Vec<f64>,
    pub avln:     Vec<f64>,
    /// Woody debris on the surface
    pub wdebrisc: f64,
    pub wdebrisn: f64,
    /// Dead moss
    pub dmossc:   f64,
    pub dmossn:   f64,

    pub rawcsum:  f64,
    pub somasum:  f64,
    pub somprsum: f64,
    pub somcrsum: f64,
    pub orgnsum:  f64,
    pub avlnsum:  f64,
    pub tsomc:    Vec<f64>,

    /// Recent monthly litterfall C:N per layer
    pub ltrfcn:   Vec<VecDeque<f64>>,
}

impl SoilState {
    pub fn new(numsl: usize) -> Self {
        Self {
            rawc: vec![0.0; numsl],
            soma: vec![0.0; numsl],
            sompr: vec![0.0; numsl],
            somcr: vec![0.0; numsl],
            orgn: vec![0.0; numsl],
            avln: vec![0.0; numsl],
            wdebrisc: 0.0,
            wdebrisn: 0.0,
            dmossc: 0.0,
            dmossn: 0.0,
            rawcsum: 0.0,
            somasum: 0.0,
            somprsum: 0.0,
            somcrsum: 0.0,
            orgnsum: 0.0,
            avlnsum: 0.0,
            tsomc: vec![0.0; numsl],
            ltrfcn: vec![VecDeque::with_capacity(LITTER_CN_MONTHS); numsl],
        }
    }

    /// Typical boreal peat stocks scaled by layer thickness.
    pub fn boreal_peat(profile: &SoilProfile) -> Self {
        let mut s = Self::new(profile.numsl());
        for (il, l) in profile.layers().iter().enumerate() {
            // gC/m³ for raw, active, resistant-physical, resistant-chemical; C:N
            let (raw, a, pr, cr, cn) = match l.kind {
                LayerKind::Moss => (30_000.0, 2_000.0, 5_000.0, 1_000.0, 50.0),
                LayerKind::Shallow => (25_000.0, 5_000.0, 20_000.0, 10_000.0, 35.0),
                LayerKind::Deep => (5_000.0, 8_000.0, 40_000.0, 40_000.0, 30.0),
                LayerKind::Mineral => (500.0, 1_500.0, 6_000.0, 15_000.0, 20.0),
            };
            s.rawc[il] = raw * l.dz;
            s.soma[il] = a * l.dz;
            s.sompr[il] = pr * l.dz;
            s.somcr[il] = cr * l.dz;
            s.orgn[il] = (raw + a + pr + cr) * l.dz / cn;
            s.avln[il] = 0.05 + 0.5 * l.dz;
        }
        s.wdebrisc = 300.0;
        s.wdebrisn = 1.0;
        s.dmossc = 150.0;
        s.dmossn = 1.5;
        s.update_aggregates();
        s
    }

    #[inline] pub fn numsl(&self) -> usize { self.rawc.len() }

    pub fn update_aggregates(&mut self) {
        self.rawcsum = self.rawc.iter().sum();
        self.somasum = self.soma.iter().sum();
        self.somprsum = self.sompr.iter().sum();
        self.somcrsum = self.somcr.iter().sum();
        self.orgnsum = self.orgn.iter().sum();
        self.avlnsum = self.avln.iter().sum();
        for il in 0..self.numsl() {
            self.tsomc[il] = self.rawc[il] + self.soma[il] + self.sompr[il] + self.somcr[il];
        }
    }

    pub fn total_c(&self) -> f64 {
        self.rawc.iter().chain(&self.soma).chain(&self.sompr).chain(&self.somcr).sum::<f64>()
            + self.wdebrisc
            + self.dmossc
    }

    pub fn total_n(&self) -> f64 {
        self.orgn.iter().chain(&self.avln).sum::<f64>() + self.wdebrisn + self.dmossn
    }

    /// Append this month's litterfall C:N for every layer that received N.
    pub fn record_litter_cn(&mut self, ltrflc: &[f64], ltrfln: &[f64]) {
        for (il, hist) in self.ltrfcn.iter_mut().enumerate() {
            let (c, n) = (ltrflc.get(il).copied().unwrap_or(0.0), ltrfln.get(il).copied().unwrap_or(0.0));
            if n > 0.0 && c > 0.0 {
                if hist.len() == LITTER_CN_MONTHS {
                    hist.pop_front();
                }
                hist.push_back(c / n);
            }
        }
    }

    /// Mean recorded litterfall C:N of layer `il`, if any was recorded.
    pub fn mean_litter_cn(&self, il: usize) -> Option<f64> {
        let hist = self.ltrfcn.get(il)?;
        if hist.is_empty() {
            None
        } else {
            Some(hist.iter().sum::<f64>() / hist.len() as f64)
        }
    }
}

/// Monthly soil flux totals read back from the flux slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoilFluxes {
    pub rhrawc:   Vec<f64>,
    pub rhsoma:   Vec<f64>,
    pub rhsompr:  Vec<f64>,
    pub rhsomcr:  Vec<f64>,
    pub netnmin:  Vec<f64>,
    pub nimmob:   Vec<f64>,
    pub rhwdeb:   f64,
    pub rhmossc:  f64,
    pub orgnlost: f64,
    pub avlnlost: f64,
    /// Total heterotrophic respiration [gC/m²/month]
    pub rhtot:    f64,
}

impl SoilFluxes {
    fn resize(&mut self, numsl: usize) {
        for v in [
            &mut self.rhrawc, &mut self.rhsoma, &mut self.rhsompr,
            &mut self.rhsomcr, &mut self.netnmin, &mut self.nimmob,
        ] {
            v.clear();
            v.resize(numsl, 0.0);
        }
    }

    pub fn netnminsum(&self) -> f64 { self.netnmin.iter().sum() }
}

// ---------------------------------------------------------------------------
// Root N extraction
// ---------------------------------------------------------------------------

/// Split a vegetation N uptake total across layers by `rootfrac·avln·liq`.
pub fn distribute_root_uptake(
    profile: &SoilProfile,
    climate: &SoilClimate,
    state: &SoilState,
    total: f64,
) -> Vec<f64> {
    let n = profile.numsl();
    let weights: Vec<f64> = (0..n)
        .map(|il| {
            let liq = climate.liq.get(il).copied().unwrap_or(0.0);
            (profile.layer(il).rootfrac * state.avln[il] * liq).max(0.0)
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 && total > 0.0 {
        weights.iter().map(|w| total * w / sum).collect()
    } else {
        vec![0.0; n]
    }
}

// ---------------------------------------------------------------------------
// Marshal / unmarshal
// ---------------------------------------------------------------------------

/// Fill `y` from the live layers and surface pools; flux slots start at zero.
pub fn load_state(state: &SoilState, nfeed: bool, y: &mut StateVector) {
    use soi::*;
    y.clear();
    for il in 0..state.numsl() {
        y[RAWC + il] = state.rawc[il];
        y[SOMA + il] = state.soma[il];
        y[SOMPR + il] = state.sompr[il];
        y[SOMCR + il] = state.somcr[il];
        if nfeed {
            y[ORGN + il] = state.orgn[il];
            y[AVLN + il] = state.avln[il];
        }
    }
    y[WDEBRISC] = state.wdebrisc;
    y[DMOSSC] = state.dmossc;
    if nfeed {
        y[WDEBRISN] = state.wdebrisn;
        y[DMOSSN] = state.dmossn;
    }
}

/// Write an integrated vector back into the layers and monthly fluxes.
///
/// A negative available-N residual is reset to the clip floor and the
/// deficit taken from the same layer's organic N.
pub fn store_state(
    y: &StateVector,
    nfeed: bool,
    state: &mut SoilState,
    fluxes: &mut SoilFluxes,
) -> ClipReport {
    use soi::*;
    let numsl = state.numsl();
    let mut report = ClipReport::default();
    fluxes.resize(numsl);

    for il in 0..numsl {
        state.rawc[il] = y[RAWC + il];
        state.soma[il] = y[SOMA + il];
        state.sompr[il] = y[SOMPR + il];
        state.somcr[il] = y[SOMCR + il];
        fluxes.rhrawc[il] = y[RH_RAW + il];
        fluxes.rhsoma[il] = y[RH_SOMA + il];
        fluxes.rhsompr[il] = y[RH_SOMPR + il];
        fluxes.rhsomcr[il] = y[RH_SOMCR + il];
    }
    state.wdebrisc = y[WDEBRISC];
    state.dmossc = y[DMOSSC];
    fluxes.rhwdeb = y[RH_WD];
    fluxes.rhmossc = y[RH_DMOSS];

    if nfeed {
        for il in 0..numsl {
            state.orgn[il] = y[ORGN + il];
            state.avln[il] = y[AVLN + il];
            report.apply(&mut state.avln[il], &mut state.orgn[il]);
            fluxes.netnmin[il] = y[NMIN + il];
            fluxes.nimmob[il] = y[NIMMOB + il];
        }
        state.wdebrisn = y[WDEBRISN];
        state.dmossn = y[DMOSSN];
        fluxes.orgnlost = y[ORGNLOSS];
        fluxes.avlnlost = y[AVLNLOSS];
        if report.clipped > 0 {
            debug!("soil available N clipped in {} layer(s), {:.3e} gN taken from organic N",
                report.clipped, report.deficit);
        }
    } else {
        fluxes.orgnlost = 0.0;
        fluxes.avlnlost = 0.0;
    }

    fluxes.rhtot = fluxes.rhrawc.iter()
        .chain(&fluxes.rhsoma)
        .chain(&fluxes.rhsompr)
        .chain(&fluxes.rhsomcr)
        .sum::<f64>()
        + fluxes.rhwdeb
        + fluxes.rhmossc;

    state.update_aggregates();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateLayout, CLIP_FLOOR};

    fn sample() -> (SoilProfile, SoilState) {
        let p = SoilProfile::boreal_peat();
        let s = SoilState::boreal_peat(&p);
        (p, s)
    }

    #[test]
    fn test_marshal_offsets() {
        let (p, s) = sample();
        let layout = StateLayout::soil(p.numsl(), true).unwrap();
        let mut y = StateVector::zeros(&layout);
        y[soi::RH_RAW] = 5.0;
        load_state(&s, true, &mut y);
        assert_eq!(y[soi::RAWC + 3], s.rawc[3]);
        assert_eq!(y[soi::SOMCR + 10], s.somcr[10]);
        assert_eq!(y[soi::AVLN + 4], s.avln[4]);
        assert_eq!(y[soi::SOMA + 11], 0.0, "inactive layer stays zero");
        assert_eq!(y[soi::DMOSSN], s.dmossn);
        assert_eq!(y[soi::RH_RAW], 0.0);

        let mut back = s.clone();
        let mut f = SoilFluxes::default();
        let report = store_state(&y, true, &mut back, &mut f);
        assert_eq!(report.clipped, 0);
        assert_eq!(back, s);
        assert_eq!(f.rhrawc.len(), p.numsl());
    }

    #[test]
    fn test_without_nfeed_n_not_marshalled() {
        let (p, s) = sample();
        let layout = StateLayout::soil(p.numsl(), false).unwrap();
        let mut y = StateVector::zeros(&layout);
        load_state(&s, false, &mut y);
        assert_eq!(y[soi::ORGN], 0.0);
        assert_eq!(y[soi::WDEBRISN], 0.0);

        let mut back = s.clone();
        store_state(&y, false, &mut back, &mut SoilFluxes::default());
        assert_eq!(back.orgn, s.orgn);
        assert_eq!(back.avln, s.avln);
    }

    #[test]
    fn test_unmarshal_clips_available_n() {
        let (p, mut s) = sample();
        let layout = StateLayout::soil(p.numsl(), true).unwrap();
        let mut y = StateVector::zeros(&layout);
        load_state(&s, true, &mut y);
        y[soi::AVLN + 2] = -0.01;
        let orgn = y[soi::ORGN + 2];
        let n_before: f64 = (0..p.numsl()).map(|il| y[soi::ORGN + il] + y[soi::AVLN + il]).sum();

        let report = store_state(&y, true, &mut s, &mut SoilFluxes::default());
        assert_eq!(report.clipped, 1);
        assert_eq!(s.avln[2], CLIP_FLOOR);
        assert!((s.orgn[2] - (orgn - 0.011)).abs() < 1e-12);
        assert!((s.orgnsum + s.avlnsum - n_before).abs() < 1e-9, "clipping moves N, never creates it");
    }

    #[test]
    fn test_root_uptake_follows_roots_and_water() {
        let (p, s) = sample();
        let climate = SoilClimate::uniform(&p, 8.0, 0.5);
        let ext = distribute_root_uptake(&p, &climate, &s, 0.6);
        assert!((ext.iter().sum::<f64>() - 0.6).abs() < 1e-12);
        assert_eq!(ext[0], 0.0, "moss has no roots");
        assert_eq!(ext[10], 0.0);
        assert!(ext[2] > 0.0);

        let frozen = SoilClimate::uniform(&p, -5.0, 0.5);
        assert!(distribute_root_uptake(&p, &frozen, &s, 0.6).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_litter_cn_history_is_bounded() {
        let mut s = SoilState::new(2);
        assert_eq!(s.mean_litter_cn(0), None);
        for m in 0..20 {
            s.record_litter_cn(&[40.0 + m as f64, 0.0], &[1.0, 0.0]);
        }
        assert_eq!(s.ltrfcn[0].len(), LITTER_CN_MONTHS);
        assert!(s.ltrfcn[1].is_empty());
        // Last twelve months: 48..=59
        assert!((s.mean_litter_cn(0).unwrap() - 53.5).abs() < 1e-12);
    }
}
