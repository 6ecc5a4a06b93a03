use crate::error::CommunicationError;

/// Parameters of one harmonic-analysis fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotRequest {
    /// 0-based instrument channel (0 or 1).
    pub channel: u8,
    pub fundamental_hz: u32,
    pub max_freq_hz: u32,
    /// Snap nominal harmonic frequencies to the nearest true spectral peak.
    pub correct_peaks: bool,
    /// Harmonics below this level (dBVrms) are not reported.
    pub min_level_db: i32,
}

/// Anything that can produce a fresh harmonic-analysis result on demand.
///
/// Implementations own their connection lifecycle; a failed fetch is returned
/// as-is and never retried by the caller.
pub trait SnapshotSource {
    fn fetch_snapshot(
        &mut self,
        request: &SnapshotRequest,
    ) -> Result<HarmonicSnapshot, CommunicationError>;
}

/// One complete harmonic-analysis result.
///
/// Built through [`HarmonicSnapshot::new`], which rejects anything that breaks
/// the shape the renderer relies on: aligned axes, a strictly increasing
/// frequency axis and a non-empty, in-range, ascending list of harmonic bins
/// whose first entry is the fundamental.
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicSnapshot {
    thd_percent: f64,
    frequencies: Vec<f64>,
    spectrum: Vec<f64>,
    harmonic_bins: Vec<usize>,
}

impl HarmonicSnapshot {
    pub fn new(
        thd_percent: f64,
        frequencies: Vec<f64>,
        spectrum: Vec<f64>,
        harmonic_bins: Vec<usize>,
    ) -> Result<Self, CommunicationError> {
        if frequencies.len() != spectrum.len() {
            return Err(CommunicationError::InvalidSnapshot(format!(
                "frequency axis has {} points but spectrum has {}",
                frequencies.len(),
                spectrum.len()
            )));
        }
        if frequencies.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CommunicationError::InvalidSnapshot(
                "frequency axis is not strictly increasing".to_string(),
            ));
        }
        if harmonic_bins.is_empty() {
            return Err(CommunicationError::InvalidSnapshot(
                "no fundamental bin".to_string(),
            ));
        }
        if let Some(&bad) = harmonic_bins.iter().find(|&&bin| bin >= spectrum.len()) {
            return Err(CommunicationError::InvalidSnapshot(format!(
                "harmonic bin {} outside spectrum of {} points",
                bad,
                spectrum.len()
            )));
        }
        if harmonic_bins.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CommunicationError::InvalidSnapshot(
                "harmonic bins are not in ascending order".to_string(),
            ));
        }

        Ok(Self {
            thd_percent,
            frequencies,
            spectrum,
            harmonic_bins,
        })
    }

    pub fn thd_percent(&self) -> f64 {
        self.thd_percent
    }

    /// Frequency axis in Hz.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Magnitudes in Vrms, index-aligned with [`Self::frequencies`].
    pub fn spectrum(&self) -> &[f64] {
        &self.spectrum
    }

    pub fn harmonic_bins(&self) -> &[usize] {
        &self.harmonic_bins
    }

    pub fn fundamental_bin(&self) -> usize {
        self.harmonic_bins[0]
    }

    /// Bins of the detected harmonics, fundamental excluded.
    pub fn overtone_bins(&self) -> &[usize] {
        &self.harmonic_bins[1..]
    }

    /// Per-index spectrum level in dBVrms.
    pub fn levels_db(&self) -> Vec<f64> {
        self.spectrum.iter().map(|&x| level_db(x)).collect()
    }
}

/// `20 * log10(|x|)`; `-inf` for zero.
pub fn level_db(x: f64) -> f64 {
    20.0 * x.abs().log10()
}
