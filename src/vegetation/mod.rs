// ============================================================================
// Vegetation Biogeochemistry: one plant functional type, three tissues
//
// Carbon:   GPP → maintenance respiration (first claim) → growth respiration
//           → NPP (leaf first, then stem/root by cpart) − litterfall
// Nitrogen: soil uptake + resorption + labile store → structural N demand
//           (innpp / c2neven); when supply falls short, NPP is scaled down
//
// Month-invariant inputs (GPP potential, respiration Q10, leaf demand,
// litterfall seasonality, N uptake capacity, dead-standing fall) are frozen
// in VegetationDrivers before integration. VegetationRhs only reads pools
// from the tentative state.
// ============================================================================

use log::debug;
use serde::{Deserialize, Serialize};

use crate::rhs::RhsProvider;
use crate::state::{veg, ClipReport, StateLayout, StateVector, I_LEAF, NUM_PFT_PART};

/// Years after disturbance over which dead standing biomass falls.
pub const DEAD_STANDING_YEARS: f64 = 9.0;

// ---------------------------------------------------------------------------
// Domain model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationState {
    /// Tissue carbon [gC/m²]
    pub c:       [f64; NUM_PFT_PART],
    /// Tissue structural nitrogen [gN/m²]
    pub strn:    [f64; NUM_PFT_PART],
    /// Labile nitrogen store [gN/m²]
    pub labn:    f64,
    /// Dead standing carbon left by disturbance [gC/m²]
    pub deadc:   f64,
    pub deadn:   f64,
    pub call:    f64,
    pub strnall: f64,
    pub nall:    f64,
}

impl VegetationState {
    pub fn new(c: [f64; NUM_PFT_PART], strn: [f64; NUM_PFT_PART], labn: f64) -> Self {
        let mut s = Self { c, strn, labn, deadc: 0.0, deadn: 0.0, call: 0.0, strnall: 0.0, nall: 0.0 };
        s.update_aggregates();
        s
    }

    /// Mature boreal evergreen stand.
    pub fn boreal_forest() -> Self {
        Self::new([220.0, 3_800.0, 1_100.0], [6.5, 24.0, 17.0], 1.2)
    }

    pub fn update_aggregates(&mut self) {
        self.call = self.c.iter().sum();
        self.strnall = self.strn.iter().sum();
        self.nall = self.labn + self.strnall;
    }

    /// Remove all dead standing C and N, returning them.
    pub fn take_dead_standing(&mut self) -> (f64, f64) {
        let out = (self.deadc, self.deadn);
        self.deadc = 0.0;
        self.deadn = 0.0;
        out
    }
}

impl Default for VegetationState {
    fn default() -> Self { Self::boreal_forest() }
}

/// Monthly vegetation flux totals read back from the flux slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VegetationFluxes {
    pub ingpp:      [f64; NUM_PFT_PART],
    pub innpp:      [f64; NUM_PFT_PART],
    pub gpp:        [f64; NUM_PFT_PART],
    pub npp:        [f64; NUM_PFT_PART],
    pub rm:         [f64; NUM_PFT_PART],
    pub rg:         [f64; NUM_PFT_PART],
    pub ltrfalc:    [f64; NUM_PFT_PART],
    pub snuptake:   [f64; NUM_PFT_PART],
    pub nmobil:     [f64; NUM_PFT_PART],
    pub nresorb:    [f64; NUM_PFT_PART],
    pub ltrfaln:    [f64; NUM_PFT_PART],
    pub innuptake:  f64,
    pub lnuptake:   f64,
    pub gppall:     f64,
    pub nppall:     f64,
    pub rmall:      f64,
    pub rgall:      f64,
    pub ltrfalcall: f64,
    pub ltrfalnall: f64,
    /// Structural plus labile uptake actually drawn from soil.
    pub nuptakeall: f64,
}

impl VegetationFluxes {
    fn summarize(&mut self) {
        self.gppall = self.gpp.iter().sum();
        self.nppall = self.npp.iter().sum();
        self.rmall = self.rm.iter().sum();
        self.rgall = self.rg.iter().sum();
        self.ltrfalcall = self.ltrfalc.iter().sum();
        self.ltrfalnall = self.ltrfaln.iter().sum();
        self.nuptakeall = self.snuptake.iter().sum::<f64>() + self.lnuptake;
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationParams {
    /// NPP allocation ratios; leaf entry only gates N allocation
    pub cpart:       [f64; NUM_PFT_PART],
    /// Growth respiration fraction of NPP
    pub frg:         f64,
    /// Maintenance respiration: kr = exp(kra·C + krb)
    pub kra:         f64,
    pub krb:         [f64; NUM_PFT_PART],
    /// Maximum monthly litterfall fractions
    pub cfall:       [f64; NUM_PFT_PART],
    pub nfall:       [f64; NUM_PFT_PART],
    /// C:N of new production
    pub c2neven:     [f64; NUM_PFT_PART],
    /// Labile N capacity as a fraction of structural N
    pub labncon:     f64,
    /// Cubic Q10 for maintenance respiration
    pub raq10a:      [f64; 4],
    /// Maintenance respiration ceiling as a fraction of tissue C
    pub rm_cap_frac: f64,
    /// Year-end C:N adjustment: c2neven = max(c2nmin, c2nb + c2na·EET/PET)·(1 + dc2n·ΔCO2)
    pub c2nb:        [f64; NUM_PFT_PART],
    pub c2na:        f64,
    pub c2nmin:      [f64; NUM_PFT_PART],
    pub dc2n:        f64,
    /// Half-saturation of root-zone N uptake
    pub knuptake:    f64,
    /// Maximum N uptake [gN/m²/month]
    pub nmax:        f64,
}

impl Default for VegetationParams {
    fn default() -> Self {
        Self {
            cpart:       [0.25, 0.45, 0.30],
            frg:         0.2,
            kra:         -8.06e-5,
            krb:         [-4.2, -7.0, -5.4],
            cfall:       [0.012, 0.0008, 0.0035],
            nfall:       [0.010, 0.0006, 0.0030],
            c2neven:     [32.0, 160.0, 65.0],
            labncon:     0.05,
            raq10a:      [2.35665, -0.05308, 0.00238, -0.00004],
            rm_cap_frac: 0.10,
            c2nb:        [28.0, 150.0, 58.0],
            c2na:        8.0,
            c2nmin:      [20.0, 100.0, 40.0],
            dc2n:        0.0,
            knuptake:    0.004,
            nmax:        3.0,
        }
    }
}

impl VegetationParams {
    /// Maintenance respiration temperature multiplier.
    pub fn respiration_q10(&self, tair: f64) -> f64 {
        let [a0, a1, a2, a3] = self.raq10a;
        let q10 = a0 + a1 * tair + a2 * tair * tair + a3 * tair * tair * tair;
        q10.powf(tair / 10.0)
    }

    /// Root-zone N uptake capacity: saturating in moisture-weighted
    /// available N, `x = Σ rootfrac·avln·knmoist`.
    pub fn nuptake_capacity(&self, rootzone_n: f64) -> f64 {
        let x = rootzone_n.max(0.0);
        if x <= 0.0 {
            return 0.0;
        }
        self.nmax * x / (self.knuptake + x)
    }

    /// Year-end adjustment of new-production C:N to moisture and CO2.
    pub fn update_c2neven(&mut self, yreet: f64, yrpet: f64, initco2: f64, co2: f64) {
        let adj = 1.0 + self.dc2n * (co2 - initco2);
        for i in 0..NUM_PFT_PART {
            let mut cn = if yrpet > 0.0 {
                self.c2nb[i] + self.c2na * (yreet / yrpet)
            } else {
                self.c2nb[i]
            };
            cn = cn.max(self.c2nmin[i]);
            self.c2neven[i] = cn * adj;
        }
    }
}

// ---------------------------------------------------------------------------
// Frozen monthly drivers
// ---------------------------------------------------------------------------

/// Month inputs the vegetation RHS needs from outside the pool system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VegetationInputs {
    /// Potential GPP without N limitation [gC/m²/month]
    pub ingppall:          f64,
    pub tair:              f64,
    /// Annual maximum leaf C [gC/m²]
    pub maxleafc:          f64,
    /// Seasonal foliage index [0, 1]
    pub fleaf:             f64,
    /// Seasonal litterfall scaling [0, 1]
    pub fltrfall:          f64,
    /// Uptake capacity from root-zone conditions [gN/m²/month]
    pub nuptake_capacity:  f64,
    /// Soil available N summed over the profile [gN/m²]
    pub avlnsum:           f64,
    pub yrsdist:           f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VegetationDrivers {
    pub ingppall:   f64,
    pub raq10:      f64,
    /// Leaf C still needed to reach the seasonal target
    pub dleafc:     f64,
    pub fltrfall:   f64,
    pub innuptake:  f64,
    pub d2wdebrisc: f64,
    pub d2wdebrisn: f64,
    pub nfeed:      bool,
}

impl VegetationDrivers {
    pub fn prepare(
        params: &VegetationParams,
        state: &VegetationState,
        inputs: &VegetationInputs,
        nfeed: bool,
    ) -> Self {
        let dleafc = (inputs.maxleafc * inputs.fleaf - state.c[I_LEAF]).max(0.0);
        let innuptake = inputs.nuptake_capacity.max(0.0).min(0.95 * inputs.avlnsum.max(0.0));

        let (d2wdebrisc, d2wdebrisn) = if inputs.yrsdist < DEAD_STANDING_YEARS {
            let rate = 1.0 / (DEAD_STANDING_YEARS * 12.0);
            (state.deadc.max(0.0) * rate, if nfeed { state.deadn.max(0.0) * rate } else { 0.0 })
        } else {
            (0.0, 0.0)
        };

        Self {
            ingppall: inputs.ingppall.max(0.0),
            raq10: params.respiration_q10(inputs.tair),
            dleafc,
            fltrfall: inputs.fltrfall.clamp(0.0, 1.0),
            innuptake,
            d2wdebrisc,
            d2wdebrisn,
            nfeed,
        }
    }
}

// ---------------------------------------------------------------------------
// RHS
// ---------------------------------------------------------------------------

pub struct VegetationRhs {
    layout:  StateLayout,
    params:  VegetationParams,
    drivers: VegetationDrivers,
}

impl VegetationRhs {
    pub fn new(params: VegetationParams, drivers: VegetationDrivers) -> Self {
        Self { layout: StateLayout::vegetation(drivers.nfeed), params, drivers }
    }

    pub fn drivers(&self) -> &VegetationDrivers { &self.drivers }
}

/// Per-tissue rates evaluated at one tentative state.
#[derive(Default)]
struct Rates {
    ingpp:    [f64; NUM_PFT_PART],
    innpp:    [f64; NUM_PFT_PART],
    gpp:      [f64; NUM_PFT_PART],
    npp:      [f64; NUM_PFT_PART],
    rm:       [f64; NUM_PFT_PART],
    rg:       [f64; NUM_PFT_PART],
    ltrfalc:  [f64; NUM_PFT_PART],
    snuptake: [f64; NUM_PFT_PART],
    nmobil:   [f64; NUM_PFT_PART],
    nresorb:  [f64; NUM_PFT_PART],
    ltrfaln:  [f64; NUM_PFT_PART],
    lnuptake: f64,
}

impl VegetationRhs {
    fn carbon(&self, c: &[f64; NUM_PFT_PART], r: &mut Rates) {
        let p = &self.params;
        let d = &self.drivers;

        for i in 0..NUM_PFT_PART {
            if c[i] > 0.0 {
                let kr = (p.kra * c[i] + p.krb[i]).exp();
                r.rm[i] = (kr * c[i] * d.raq10).clamp(0.0, p.rm_cap_frac * c[i]);
            }
        }
        let rmall: f64 = r.rm.iter().sum();
        let rmadj = if rmall > d.ingppall && rmall > 0.0 { d.ingppall / rmall } else { 1.0 };

        // Respiration takes the first claim, then leaf growth, then stem/root.
        let innppall = (d.ingppall - rmall).max(0.0) / (1.0 + p.frg);
        r.innpp[I_LEAF] = (d.dleafc / (1.0 + p.frg)).min(innppall);
        r.rg[I_LEAF] = p.frg * r.innpp[I_LEAF];
        let leaf_cost = r.innpp[I_LEAF] + r.rg[I_LEAF];

        let rest = (d.ingppall - rmall - leaf_cost).max(0.0) / (1.0 + p.frg);
        let cpartrest: f64 = p.cpart[I_LEAF + 1..].iter().sum();
        if cpartrest > 0.0 && rest > 0.0 {
            for i in I_LEAF + 1..NUM_PFT_PART {
                r.innpp[i] = rest * p.cpart[i] / cpartrest;
                r.rg[i] = p.frg * r.innpp[i];
            }
        }

        for i in 0..NUM_PFT_PART {
            r.ingpp[i] = r.innpp[i] + r.rm[i] * rmadj + r.rg[i];
            r.ltrfalc[i] = if p.cfall[i] > 0.0 { (d.fltrfall * p.cfall[i] * c[i]).max(0.0) } else { 0.0 };
            r.gpp[i] = r.ingpp[i];
            r.npp[i] = r.innpp[i];
        }
    }

    fn nitrogen(&self, c: &[f64; NUM_PFT_PART], strn: &[f64; NUM_PFT_PART], labn: f64, r: &mut Rates) {
        let p = &self.params;
        let d = &self.drivers;

        // Litterfall N, capped at the tissue C:N; the remainder is resorbed.
        for i in 0..NUM_PFT_PART {
            r.ltrfaln[i] = if p.nfall[i] > 0.0 { (d.fltrfall * p.nfall[i] * strn[i]).max(0.0) } else { 0.0 };
            let c2n = if strn[i] > 0.0 { c[i] / strn[i] } else { 0.0 };
            if c2n > 0.0 {
                let matched = r.ltrfalc[i] / c2n;
                if r.ltrfaln[i] <= matched {
                    r.nresorb[i] = matched - r.ltrfaln[i];
                } else {
                    r.ltrfaln[i] = matched;
                }
            } else {
                r.ltrfaln[i] = 0.0;
            }
        }
        let nresorball: f64 = r.nresorb.iter().sum();

        let mut nrequire = [0.0; NUM_PFT_PART];
        for i in 0..NUM_PFT_PART {
            if r.innpp[i] > 0.0 {
                nrequire[i] = r.innpp[i] / p.c2neven[i];
            }
        }
        let nrequireall: f64 = nrequire.iter().sum();
        let share = |i: usize| (nrequire[i] / nrequireall.max(1e-8)).clamp(0.0, 1.0);

        let uptake = d.innuptake;
        let templabn = nresorball + labn;
        let nsupply = uptake + templabn;
        let reduction = if nrequireall > 0.0 { (nsupply / nrequireall).max(0.0) } else { 1.0 };

        if reduction < 1.0 {
            for i in 0..NUM_PFT_PART {
                if p.cpart[i] > 0.0 {
                    r.npp[i] = r.innpp[i] * reduction;
                    r.rg[i] = if r.npp[i] > 0.0 { p.frg * r.npp[i] } else { 0.0 };
                    r.gpp[i] = (r.npp[i] + r.rg[i] + r.rm[i]).max(0.0);
                    r.nmobil[i] = share(i) * templabn;
                    r.snuptake[i] = share(i) * uptake;
                } else {
                    r.npp[i] = 0.0;
                    r.rg[i] = 0.0;
                    r.gpp[i] = 0.0;
                }
            }
        } else if templabn >= nrequireall {
            for i in 0..NUM_PFT_PART {
                if p.cpart[i] > 0.0 {
                    r.nmobil[i] = nrequire[i];
                }
            }
        } else {
            // Labile store is emptied first, soil uptake covers the rest.
            for i in 0..NUM_PFT_PART {
                if p.cpart[i] > 0.0 {
                    r.nmobil[i] = templabn * nrequire[i] / nrequireall.max(1e-8);
                    r.snuptake[i] = (r.npp[i] / p.c2neven[i] - r.nmobil[i]).max(0.0);
                }
            }
        }

        // Whatever capacity structural growth left unused refills the labile
        // store, up to labncon of the post-step structural N.
        let snuptakeall: f64 = r.snuptake.iter().sum();
        let nmobilall: f64 = r.nmobil.iter().sum();
        let nfall: f64 = r.ltrfaln.iter().sum();
        let strnall: f64 = strn.iter().sum();

        let nsurplus = nsupply - snuptakeall - nmobilall;
        let nstruc = strnall + snuptakeall + nmobilall - nfall - nresorball;
        r.lnuptake = if nsurplus <= p.labncon * nstruc {
            uptake - snuptakeall
        } else {
            p.labncon * nstruc - (labn + nresorball - nmobilall)
        };
        if r.lnuptake < 1e-10 {
            r.lnuptake = 0.0;
        }
    }
}

impl RhsProvider for VegetationRhs {
    fn layout(&self) -> &StateLayout { &self.layout }

    fn derivatives(&self, y: &[f64], dydt: &mut [f64]) {
        use veg::*;
        dydt.fill(0.0);

        let mut c = [0.0; NUM_PFT_PART];
        let mut strn = [0.0; NUM_PFT_PART];
        for i in 0..NUM_PFT_PART {
            c[i] = y[VEGC + i];
            strn[i] = y[STRN + i];
        }

        let mut r = Rates::default();
        self.carbon(&c, &mut r);
        if self.drivers.nfeed {
            self.nitrogen(&c, &strn, y[LABN], &mut r);
        }

        dydt[DEADC] = -self.drivers.d2wdebrisc;
        for i in 0..NUM_PFT_PART {
            dydt[VEGC + i] = r.npp[i] - r.ltrfalc[i];

            dydt[INGPP + i] = r.ingpp[i];
            dydt[INNPP + i] = r.innpp[i];
            dydt[GPP + i] = r.gpp[i];
            dydt[NPP + i] = r.npp[i];
            dydt[RM + i] = r.rm[i];
            dydt[RG + i] = r.rg[i];
            dydt[LTRC + i] = r.ltrfalc[i];
        }

        if self.drivers.nfeed {
            dydt[DEADN] = -self.drivers.d2wdebrisn;
            dydt[LABN] = r.lnuptake;
            for i in 0..NUM_PFT_PART {
                dydt[STRN + i] = r.snuptake[i] + r.nmobil[i] - r.ltrfaln[i] - r.nresorb[i];
                dydt[LABN] += r.nresorb[i] - r.nmobil[i];

                dydt[SNUP + i] = r.snuptake[i];
                dydt[NMBOL + i] = r.nmobil[i];
                dydt[NRSRB + i] = r.nresorb[i];
                dydt[LTRN + i] = r.ltrfaln[i];
            }
            dydt[INNUP] = self.drivers.innuptake;
            dydt[LNUP] = r.lnuptake;
        }
    }
}

// ---------------------------------------------------------------------------
// Marshal / unmarshal
// ---------------------------------------------------------------------------

/// Fill `y` from the domain pools; flux slots start the month at zero.
pub fn load_state(state: &VegetationState, nfeed: bool, y: &mut StateVector) {
    use veg::*;
    y.clear();
    for i in 0..NUM_PFT_PART {
        y[VEGC + i] = state.c[i];
    }
    y[DEADC] = state.deadc;
    if nfeed {
        for i in 0..NUM_PFT_PART {
            y[STRN + i] = state.strn[i];
        }
        y[LABN] = state.labn;
        y[DEADN] = state.deadn;
    }
}

/// Write an integrated vector back into the domain pools and monthly fluxes.
pub fn store_state(
    y: &StateVector,
    nfeed: bool,
    state: &mut VegetationState,
    fluxes: &mut VegetationFluxes,
) -> ClipReport {
    use veg::*;
    let mut report = ClipReport::default();

    for i in 0..NUM_PFT_PART {
        state.c[i] = y[VEGC + i];
        fluxes.ingpp[i] = y[INGPP + i];
        fluxes.innpp[i] = y[INNPP + i];
        fluxes.gpp[i] = y[GPP + i];
        fluxes.npp[i] = y[NPP + i];
        fluxes.rm[i] = y[RM + i];
        fluxes.rg[i] = y[RG + i];
        fluxes.ltrfalc[i] = y[LTRC + i];
    }
    state.deadc = y[DEADC];

    if nfeed {
        for i in 0..NUM_PFT_PART {
            state.strn[i] = y[STRN + i];
            fluxes.snuptake[i] = y[SNUP + i];
            fluxes.nmobil[i] = y[NMBOL + i];
            fluxes.nresorb[i] = y[NRSRB + i];
            fluxes.ltrfaln[i] = y[LTRN + i];
        }
        state.labn = y[LABN];
        state.deadn = y[DEADN];
        fluxes.innuptake = y[INNUP];
        fluxes.lnuptake = y[LNUP];

        let mut labn = state.labn;
        report.apply(&mut labn, &mut state.strn[I_LEAF]);
        state.labn = labn;
        if report.clipped > 0 {
            debug!("vegetation labile N clipped, {:.3e} gN borrowed from leaf N", report.deficit);
        }
    } else {
        fluxes.snuptake = [0.0; NUM_PFT_PART];
        fluxes.nmobil = [0.0; NUM_PFT_PART];
        fluxes.nresorb = [0.0; NUM_PFT_PART];
        fluxes.ltrfaln = [0.0; NUM_PFT_PART];
        fluxes.innuptake = 0.0;
        fluxes.lnuptake = 0.0;
    }

    state.update_aggregates();
    fluxes.summarize();
    report
}
