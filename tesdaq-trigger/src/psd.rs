//! Noise power spectral density estimation.

use crate::{Error, Result};
use num_complex::Complex;
use rustfft::FftPlanner;

/// Folded (one-sided) noise power spectral density.
///
/// Values are in units²/Hz over `nb_samples/2 + 1` bins; interior bins
/// carry the power of both spectral halves.
#[derive(Clone, Debug)]
pub struct NoisePsd {
    /// Sampling rate the PSD was estimated at, in Hz.
    pub sample_rate: f64,
    /// One-sided PSD values, DC through Nyquist.
    pub values: Vec<f64>,
}

impl NoisePsd {
    /// Trace length the PSD was estimated from.
    #[must_use]
    pub fn nb_samples(&self) -> usize {
        (self.values.len() - 1) * 2
    }

    /// Frequency of each bin in Hz.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn frequencies(&self) -> Vec<f64> {
        let n = self.nb_samples() as f64;
        (0..self.values.len())
            .map(|k| k as f64 * self.sample_rate / n)
            .collect()
    }

    /// Linearly interpolated one-sided PSD value at `freq` Hz.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn value_at(&self, freq: f64) -> f64 {
        let df = self.sample_rate / self.nb_samples() as f64;
        let position = (freq / df).clamp(0.0, (self.values.len() - 1) as f64);
        let low = position.floor() as usize;
        let high = position.ceil() as usize;
        if low == high {
            return self.values[low];
        }
        let frac = position - low as f64;
        self.values[low] * (1.0 - frac) + self.values[high] * frac
    }
}

/// Estimates a folded PSD by averaging periodograms of noise traces.
///
/// Each trace has its mean removed before the transform. All traces must
/// share one even length.
///
/// # Errors
/// Returns [`Error::DataQuality`] when no traces are given and
/// [`Error::Config`] for inconsistent or odd lengths.
#[allow(clippy::cast_precision_loss)]
pub fn fold_psd(traces: &[Vec<f64>], sample_rate: f64) -> Result<NoisePsd> {
    let Some(first) = traces.first() else {
        return Err(Error::DataQuality(
            "no noise traces survive; cannot estimate a PSD".to_string(),
        ));
    };
    let n = first.len();
    if n < 2 || n % 2 != 0 {
        return Err(Error::Config(format!(
            "PSD estimation needs an even trace length, got {n}"
        )));
    }
    if traces.iter().any(|t| t.len() != n) {
        return Err(Error::Config(
            "noise traces have inconsistent lengths".to_string(),
        ));
    }
    if sample_rate <= 0.0 {
        return Err(Error::Config("sample rate must be positive".to_string()));
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let mut folded = vec![0.0; n / 2 + 1];
    for trace in traces {
        let mean: f64 = trace.iter().sum::<f64>() / n as f64;
        let mut buffer: Vec<Complex<f64>> = trace
            .iter()
            .map(|&v| Complex::new(v - mean, 0.0))
            .collect();
        fft.process(&mut buffer);

        let scale = 1.0 / (sample_rate * n as f64);
        for (k, value) in folded.iter_mut().enumerate() {
            let power = buffer[k].norm_sqr() * scale;
            // interior bins absorb the mirrored half of the spectrum
            let power = if k == 0 || k == n / 2 { power } else { 2.0 * power };
            *value += power;
        }
    }
    let count = traces.len() as f64;
    for value in &mut folded {
        *value /= count;
    }
    Ok(NoisePsd {
        sample_rate,
        values: folded,
    })
}

/// Automated pileup cut over collected noise traces.
///
/// Traces whose peak-to-peak range sits more than `nsigma` standard
/// deviations above the mean range are dropped; the cut is re-applied on
/// the survivors until it stabilizes. Returns the surviving indices,
/// ascending.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn pileup_cut(traces: &[Vec<f64>], nsigma: f64) -> Vec<usize> {
    let range = |trace: &Vec<f64>| -> f64 {
        let max = trace.iter().copied().fold(f64::MIN, f64::max);
        let min = trace.iter().copied().fold(f64::MAX, f64::min);
        max - min
    };
    let metrics: Vec<f64> = traces.iter().map(range).collect();

    let mut kept: Vec<usize> = (0..traces.len()).collect();
    loop {
        if kept.len() < 2 {
            return kept;
        }
        let n = kept.len() as f64;
        let mean = kept.iter().map(|&i| metrics[i]).sum::<f64>() / n;
        let var = kept
            .iter()
            .map(|&i| (metrics[i] - mean).powi(2))
            .sum::<f64>()
            / n;
        let cutoff = mean + nsigma * var.sqrt();
        let survivors: Vec<usize> = kept
            .iter()
            .copied()
            .filter(|&i| metrics[i] <= cutoff)
            .collect();
        if survivors.len() == kept.len() {
            return survivors;
        }
        kept = survivors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_flat_psd_of_known_sine() {
        // a pure tone concentrates its power in one folded bin
        let n = 256;
        let fs = 1000.0;
        let k = 16;
        #[allow(clippy::cast_precision_loss)]
        let trace: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * k as f64 * i as f64 / n as f64).sin())
            .collect();
        let psd = fold_psd(&[trace], fs).unwrap();

        let total: f64 = psd.values.iter().sum();
        assert_relative_eq!(psd.values[k] / total, 1.0, epsilon = 1e-9);
        assert_eq!(psd.values.len(), n / 2 + 1);
        assert_eq!(psd.nb_samples(), n);
    }

    #[test]
    fn test_psd_parseval() {
        // total folded power times df equals the trace variance
        let n = 128usize;
        let nf = 128.0;
        let fs = 2000.0;
        let trace: Vec<f64> = (0..n).map(|i| f64::from(u8::from(i % 7 == 0))).collect();
        let mean = trace.iter().sum::<f64>() / nf;
        let variance = trace.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / nf;

        let psd = fold_psd(&[trace], fs).unwrap();
        let df = fs / nf;
        let power: f64 = psd.values.iter().sum::<f64>() * df;
        assert_relative_eq!(power, variance, epsilon = 1e-9);
    }

    #[test]
    fn test_fold_psd_rejects_bad_input() {
        assert!(matches!(
            fold_psd(&[], 1000.0).unwrap_err(),
            Error::DataQuality(_)
        ));
        assert!(fold_psd(&[vec![0.0; 9]], 1000.0).is_err());
        assert!(fold_psd(&[vec![0.0; 8], vec![0.0; 10]], 1000.0).is_err());
    }

    #[test]
    fn test_pileup_cut_drops_outliers() {
        let mut traces = vec![vec![0.0, 0.1, -0.1, 0.05]; 20];
        traces.push(vec![0.0, 5.0, -5.0, 0.0]);
        let kept = pileup_cut(&traces, 2.0);
        assert_eq!(kept.len(), 20);
        assert!(!kept.contains(&20));
    }

    #[test]
    fn test_pileup_cut_keeps_uniform_population() {
        let traces = vec![vec![0.0, 1.0, -1.0, 0.0]; 10];
        assert_eq!(pileup_cut(&traces, 2.0).len(), 10);
    }

    #[test]
    fn test_value_at_interpolates() {
        let psd = NoisePsd {
            sample_rate: 8.0,
            values: vec![1.0, 3.0, 5.0],
        };
        // df = 2 Hz
        assert_relative_eq!(psd.value_at(0.0), 1.0);
        assert_relative_eq!(psd.value_at(1.0), 2.0);
        assert_relative_eq!(psd.value_at(4.0), 5.0);
        assert_relative_eq!(psd.value_at(100.0), 5.0);
    }
}
