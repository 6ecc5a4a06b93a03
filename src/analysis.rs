use std::f64::consts::PI;

use log::debug;
use rayon::prelude::*;
use realfft::RealFftPlanner;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::CommunicationError;
use crate::snapshot::{level_db, HarmonicSnapshot, SnapshotRequest};

/// Shortest record worth transforming.
pub const MIN_SAMPLES: usize = 16;

/// Window function types
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WindowType {
    Rectangular,  // No window (flat)
    Hanning,
    Hamming,     // Similar to Hanning but doesn't go to zero at edges
    BlackmanHarris,
    FlatTop,     // Best amplitude accuracy
    Kaiser(f64), // Adjustable side-lobe level, beta parameter
}

impl Default for WindowType {
    fn default() -> Self {
        WindowType::FlatTop
    }
}

pub fn window_coefficients(len: usize, window_type: WindowType) -> Vec<f64> {
    if len < 2 {
        return vec![1.0; len];
    }
    match window_type {
        WindowType::Rectangular => vec![1.0; len],
        WindowType::Hanning => hanning_window(len),
        WindowType::Hamming => hamming_window(len),
        WindowType::BlackmanHarris => blackman_harris_window(len),
        WindowType::FlatTop => flattop_window(len),
        WindowType::Kaiser(beta) => kaiser_window(len, beta),
    }
}

fn hamming_window(len: usize) -> Vec<f64> {
    (0..len).map(|i| {
        let x = 2.0 * PI * i as f64 / (len - 1) as f64;
        0.54 - 0.46 * x.cos()
    }).collect()
}

fn flattop_window(len: usize) -> Vec<f64> {
    let a0 = 0.21557895;
    let a1 = 0.41663158;
    let a2 = 0.277263158;
    let a3 = 0.083578947;
    let a4 = 0.006947368;

    (0..len).map(|i| {
        let x = 2.0 * PI * i as f64 / (len - 1) as f64;
        a0 - a1 * x.cos() + a2 * (2.0 * x).cos() - a3 * (3.0 * x).cos() + a4 * (4.0 * x).cos()
    }).collect()
}

fn kaiser_window(len: usize, beta: f64) -> Vec<f64> {
    let i0_beta = bessel_i0(beta);
    (0..len).map(|i| {
        let x = beta * (1.0 - (2.0 * i as f64 / (len - 1) as f64 - 1.0).powi(2)).max(0.0).sqrt();
        bessel_i0(x) / i0_beta
    }).collect()
}

// Modified Bessel function of the first kind, order 0
fn bessel_i0(x: f64) -> f64 {
    let ax = x.abs();
    if ax < 3.75 {
        let y = (x / 3.75).powi(2);
        1.0 + y * (3.5156229 + y * (3.0899424 + y * (1.2067492
            + y * (0.2659732 + y * (0.0360768 + y * 0.0045813)))))
    } else {
        let y = 3.75 / ax;
        (ax.exp() / ax.sqrt()) * (0.39894228 + y * (0.01328592
            + y * (0.00225319 + y * (-0.00157565 + y * (0.00916281
            + y * (-0.02057706 + y * (0.02635537 + y * (-0.01647633
            + y * 0.00392377))))))))
    }
}

fn hanning_window(len: usize) -> Vec<f64> {
    (0..len).map(|i| {
        let x = 2.0 * PI * i as f64 / (len - 1) as f64;
        0.5 * (1.0 - x.cos())
    }).collect()
}

fn blackman_harris_window(len: usize) -> Vec<f64> {
    let a0 = 0.35875;
    let a1 = 0.48829;
    let a2 = 0.14128;
    let a3 = 0.01168;

    (0..len).map(|i| {
        let x = 2.0 * PI * i as f64 / (len - 1) as f64;
        a0 - a1 * x.cos() + a2 * (2.0 * x).cos() - a3 * (3.0 * x).cos()
    }).collect()
}

/// Single-sided amplitude spectrum in Vrms, bin `k` at `k * sample_rate / N`.
pub fn amplitude_spectrum(
    samples: &[f64],
    window_type: WindowType,
) -> Result<Vec<f64>, CommunicationError> {
    let window = window_coefficients(samples.len(), window_type);
    let coherent_gain: f64 = window.iter().sum();
    if coherent_gain <= 0.0 {
        return Err(CommunicationError::Analysis("window has zero gain".to_string()));
    }

    let mut indata: Vec<f64> = samples.iter().zip(&window).map(|(&s, &w)| s * w).collect();
    let mut planner = RealFftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(indata.len());
    let mut output: Vec<Complex<f64>> = fft.make_output_vec();
    fft.process(&mut indata, &mut output)
        .map_err(|e| CommunicationError::Analysis(format!("FFT computation error: {}", e)))?;

    let dc_scale = 1.0 / coherent_gain;
    let ac_scale = 2.0 / coherent_gain / 2.0_f64.sqrt();
    Ok(output
        .par_iter()
        .enumerate()
        .map(|(k, c)| c.norm() * if k == 0 { dc_scale } else { ac_scale })
        .collect())
}

/// Turns one acquired record into a [`HarmonicSnapshot`].
pub fn analyze_waveform(
    samples: &[f64],
    sample_rate: f64,
    request: &SnapshotRequest,
    window_type: WindowType,
) -> Result<HarmonicSnapshot, CommunicationError> {
    if samples.len() < MIN_SAMPLES {
        return Err(CommunicationError::Analysis(format!(
            "record of {} samples is too short",
            samples.len()
        )));
    }
    if !(sample_rate > 0.0) {
        return Err(CommunicationError::Analysis(format!(
            "invalid sample rate {}",
            sample_rate
        )));
    }

    let bin_width = sample_rate / samples.len() as f64;
    let spectrum = amplitude_spectrum(samples, window_type)?;

    // Keep only what lies inside the band of interest.
    let last_bin = ((request.max_freq_hz as f64 / bin_width).floor() as usize)
        .min(spectrum.len() - 1);
    let spectrum: Vec<f64> = spectrum[..=last_bin].to_vec();
    let frequencies: Vec<f64> = (0..=last_bin).map(|k| k as f64 * bin_width).collect();

    let f0 = request.fundamental_hz as f64;
    let nominal = (f0 / bin_width).round() as usize;
    if nominal == 0 || nominal > last_bin {
        return Err(CommunicationError::Analysis(format!(
            "fundamental {} Hz is outside the analysed band 0..{:.0} Hz",
            request.fundamental_hz,
            frequencies[last_bin]
        )));
    }

    let search = if request.correct_peaks {
        ((f0 / 2.0) / bin_width).floor() as usize
    } else {
        0
    };
    let fundamental = peak_near(&spectrum, nominal, search);
    let mut bins = vec![fundamental];

    let mut harmonic = 2u32;
    while harmonic as f64 * f0 <= request.max_freq_hz as f64 {
        let nominal = (harmonic as f64 * f0 / bin_width).round() as usize;
        if nominal > last_bin {
            break;
        }
        let bin = peak_near(&spectrum, nominal, search);
        let previous = bins[bins.len() - 1];
        if bin > previous && level_db(spectrum[bin]) >= request.min_level_db as f64 {
            bins.push(bin);
        }
        harmonic += 1;
    }

    let thd_percent = total_harmonic_distortion(&spectrum, &bins);
    debug!(
        target: "analysis",
        "fundamental at {:.1} Hz, {} harmonics above {} dB, THD {:.4}%",
        frequencies[fundamental],
        bins.len() - 1,
        request.min_level_db,
        thd_percent
    );

    HarmonicSnapshot::new(thd_percent, frequencies, spectrum, bins)
}

/// Index of the largest magnitude within `radius` bins of `center`.
fn peak_near(spectrum: &[f64], center: usize, radius: usize) -> usize {
    let lo = center.saturating_sub(radius).max(1);
    let hi = (center + radius).min(spectrum.len() - 1);
    if lo > hi {
        return center;
    }
    (lo..=hi).fold(center.min(hi).max(lo), |best, i| {
        if spectrum[i] > spectrum[best] { i } else { best }
    })
}

/// `100 * sqrt(sum of harmonic powers) / fundamental`, 0 without harmonics.
pub fn total_harmonic_distortion(spectrum: &[f64], bins: &[usize]) -> f64 {
    let fundamental = spectrum[bins[0]];
    if fundamental <= 0.0 || bins.len() < 2 {
        return 0.0;
    }
    let harmonic_power: f64 = bins[1..].iter().map(|&b| spectrum[b] * spectrum[b]).sum();
    100.0 * harmonic_power.sqrt() / fundamental
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 102_400.0;
    const N: usize = 4096; // 25 Hz bins

    fn request(min_level_db: i32) -> SnapshotRequest {
        SnapshotRequest {
            channel: 0,
            fundamental_hz: 1000,
            max_freq_hz: 10_000,
            correct_peaks: true,
            min_level_db,
        }
    }

    /// Sum of sines given as (frequency, rms volts).
    fn tones(components: &[(f64, f64)]) -> Vec<f64> {
        (0..N)
            .map(|i| {
                let t = i as f64 / FS;
                components
                    .iter()
                    .map(|&(f, rms)| rms * 2.0_f64.sqrt() * (2.0 * PI * f * t).sin())
                    .sum()
            })
            .collect()
    }

    #[test]
    fn windows_have_expected_shape() {
        let hann = window_coefficients(9, WindowType::Hanning);
        assert!(hann[0].abs() < 1e-12);
        assert!((hann[4] - 1.0).abs() < 1e-12);
        assert_eq!(window_coefficients(1, WindowType::FlatTop), vec![1.0]);
        let kaiser = window_coefficients(9, WindowType::Kaiser(8.0));
        assert!((kaiser[4] - 1.0).abs() < 1e-9);
        assert!(kaiser[0] < kaiser[4]);
    }

    #[test]
    fn amplitude_is_calibrated_in_vrms() {
        let spectrum = amplitude_spectrum(&tones(&[(1000.0, 0.5)]), WindowType::FlatTop).unwrap();
        let peak = spectrum.iter().cloned().fold(0.0, f64::max);
        assert!((peak - 0.5).abs() < 0.005, "peak {}", peak);
    }

    #[test]
    fn pure_tone_has_no_harmonics() {
        let snap = analyze_waveform(&tones(&[(1000.0, 0.1)]), FS, &request(-85), WindowType::FlatTop).unwrap();
        assert_eq!(snap.harmonic_bins(), &[40]);
        assert!((snap.frequencies()[40] - 1000.0).abs() < 1e-9);
        assert_eq!(snap.thd_percent(), 0.0);
        assert!((level_db(snap.spectrum()[40]) + 20.0).abs() < 0.1);
    }

    #[test]
    fn finds_harmonics_above_floor() {
        let samples = tones(&[(1000.0, 0.1), (2000.0, 0.01), (3000.0, 0.001)]);
        let snap = analyze_waveform(&samples, FS, &request(-85), WindowType::FlatTop).unwrap();
        assert_eq!(snap.harmonic_bins(), &[40, 80, 120]);
        let expected = 100.0 * (0.01f64.powi(2) + 0.001f64.powi(2)).sqrt() / 0.1;
        assert!((snap.thd_percent() - expected).abs() < 0.1, "thd {}", snap.thd_percent());
    }

    #[test]
    fn floor_hides_weak_harmonics() {
        let samples = tones(&[(1000.0, 0.1), (2000.0, 0.01), (3000.0, 0.001)]);
        let snap = analyze_waveform(&samples, FS, &request(-50), WindowType::FlatTop).unwrap();
        assert_eq!(snap.harmonic_bins(), &[40, 80]);
    }

    #[test]
    fn spectrum_is_cut_at_max_frequency() {
        let snap = analyze_waveform(&tones(&[(1000.0, 0.1)]), FS, &request(-85), WindowType::Hanning).unwrap();
        assert_eq!(snap.frequencies().len(), 401);
        assert!(*snap.frequencies().last().unwrap() <= 10_000.0);
    }

    #[test]
    fn peak_correction_follows_detuned_fundamental() {
        let samples = tones(&[(1050.0, 0.1)]);
        let snap = analyze_waveform(&samples, FS, &request(-85), WindowType::FlatTop).unwrap();
        assert_eq!(snap.fundamental_bin(), 42);

        let mut fixed = request(-85);
        fixed.correct_peaks = false;
        let snap = analyze_waveform(&samples, FS, &fixed, WindowType::FlatTop).unwrap();
        assert_eq!(snap.fundamental_bin(), 40);
    }

    #[test]
    fn rejects_unusable_records() {
        let short = vec![0.0; 8];
        assert!(matches!(
            analyze_waveform(&short, FS, &request(-85), WindowType::FlatTop),
            Err(CommunicationError::Analysis(_))
        ));
        let mut high = request(-85);
        high.fundamental_hz = 60_000;
        high.max_freq_hz = 80_000;
        assert!(analyze_waveform(&tones(&[(1000.0, 0.1)]), FS, &high, WindowType::FlatTop).is_err());
        assert!(analyze_waveform(&tones(&[(1000.0, 0.1)]), 0.0, &request(-85), WindowType::FlatTop).is_err());
    }
}
