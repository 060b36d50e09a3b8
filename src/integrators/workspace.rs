use super::tableau::STAGES;

/// Scratch buffers for one subsystem's trial steps.
///
/// Sized to the active layout and allocated once per cohort; successive
/// months reuse it. Only the integrator that owns it reads or writes it.
#[derive(Debug, Clone, Default)]
pub struct StepWorkspace {
    pub(crate) k: [Vec<f64>; STAGES],
    /// Tentative state at which the next stage is evaluated.
    pub(crate) ydum: Vec<f64>,
    /// Estimate committed on acceptance.
    pub(crate) dum4: Vec<f64>,
    /// Embedded comparison estimate.
    pub(crate) dum5: Vec<f64>,
    pub(crate) error: Vec<f64>,
    /// Rollback point taken at the first forced step of a month.
    pub(crate) snapshot: Vec<f64>,
}

impl StepWorkspace {
    pub fn new(len: usize) -> Self {
        let mut ws = Self::default();
        ws.ensure_len(len);
        ws
    }

    /// Resize every buffer to `len`. No-op when already that length.
    pub fn ensure_len(&mut self, len: usize) {
        if self.ydum.len() == len {
            return;
        }
        for k in self.k.iter_mut() {
            k.resize(len, 0.0);
        }
        self.ydum.resize(len, 0.0);
        self.dum4.resize(len, 0.0);
        self.dum5.resize(len, 0.0);
        self.error.resize(len, 0.0);
        self.snapshot.resize(len, 0.0);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ydum.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ydum.is_empty()
    }

    /// Committed estimate of the last trial.
    pub fn candidate(&self) -> &[f64] {
        &self.dum4
    }

    /// `|committed - embedded|` of the last completed trial.
    pub fn error(&self) -> &[f64] {
        &self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_sized_to_layout() {
        let mut ws = StepWorkspace::new(44);
        assert_eq!(ws.len(), 44);
        assert!(ws.k.iter().all(|k| k.len() == 44));
        assert_eq!(ws.snapshot.len(), 44);

        ws.ensure_len(284);
        assert_eq!(ws.error().len(), 284);
        assert_eq!(ws.candidate().len(), 284);
    }
}
