//! Optimum (matched) filter for pulse amplitude estimation.

use crate::psd::NoisePsd;
use crate::{Error, Result};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Frequency-domain optimum filter built from a pulse template and a
/// noise PSD.
///
/// Filtering a data block yields the best-fit pulse amplitude at every
/// shift; the filter's own noise resolution gives the trigger threshold
/// scale. The DC bin is excluded, so constant offsets do not bias the
/// amplitude.
pub struct OptimumFilter {
    len: usize,
    template_fft: Vec<Complex<f64>>,
    inv_noise: Vec<f64>,
    norm: f64,
    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
}

impl OptimumFilter {
    /// Builds a filter of block length `len` samples.
    ///
    /// The template is zero-padded to `len`; the PSD is interpolated onto
    /// the block's frequency grid.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for an empty or overlong template, or a
    /// PSD with non-positive bins.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(template: &[f64], psd: &NoisePsd, len: usize) -> Result<Self> {
        if template.is_empty() || template.len() > len {
            return Err(Error::Config(format!(
                "template of {} samples does not fit a {len}-sample block",
                template.len()
            )));
        }
        if psd.values.iter().any(|&v| v <= 0.0 || !v.is_finite()) {
            return Err(Error::Config(
                "noise PSD has non-positive or non-finite bins".to_string(),
            ));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(len);
        let ifft = planner.plan_fft_inverse(len);

        let mut template_fft: Vec<Complex<f64>> = template
            .iter()
            .map(|&v| Complex::new(v, 0.0))
            .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
            .take(len)
            .collect();
        fft.process(&mut template_fft);

        // Per-bin noise variance of an unnormalized length-`len` DFT:
        // S_bin = psd_two_sided(f) * fs * len.
        let fs = psd.sample_rate;
        let mut inv_noise = vec![0.0; len];
        for (k, inv) in inv_noise.iter_mut().enumerate().skip(1) {
            let folded_bin = k.min(len - k);
            let freq = folded_bin as f64 * fs / len as f64;
            let one_sided = psd.value_at(freq);
            let two_sided = if folded_bin == 0 || (len % 2 == 0 && folded_bin == len / 2) {
                one_sided
            } else {
                one_sided / 2.0
            };
            *inv = 1.0 / (two_sided * fs * len as f64);
        }

        let norm: f64 = template_fft
            .iter()
            .zip(&inv_noise)
            .map(|(t, &inv)| t.norm_sqr() * inv)
            .sum();
        if norm <= 0.0 || !norm.is_finite() {
            return Err(Error::Config(
                "optimum filter normalization vanished".to_string(),
            ));
        }

        Ok(Self {
            len,
            template_fft,
            inv_noise,
            norm,
            fft,
            ifft,
        })
    }

    /// Block length the filter operates on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero-length filter (never constructed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Expected amplitude resolution under the noise model.
    #[must_use]
    pub fn sigma_amplitude(&self) -> f64 {
        (1.0 / self.norm).sqrt()
    }

    /// Best-fit pulse amplitude at every shift of the block.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the block length does not match.
    pub fn filter_block(&self, data: &[f64]) -> Result<Vec<f64>> {
        if data.len() != self.len {
            return Err(Error::Config(format!(
                "block of {} samples fed to a {}-sample filter",
                data.len(),
                self.len
            )));
        }
        let mut buffer: Vec<Complex<f64>> =
            data.iter().map(|&v| Complex::new(v, 0.0)).collect();
        self.fft.process(&mut buffer);
        for ((value, t), &inv) in buffer.iter_mut().zip(&self.template_fft).zip(&self.inv_noise) {
            *value = t.conj() * *value * inv;
        }
        self.ifft.process(&mut buffer);
        Ok(buffer.iter().map(|v| v.re / self.norm).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::create_template;
    use approx::assert_relative_eq;

    fn white_psd(n: usize, fs: f64, level: f64) -> NoisePsd {
        NoisePsd {
            sample_rate: fs,
            values: vec![level; n / 2 + 1],
        }
    }

    #[test]
    fn test_filter_recovers_injected_amplitude_and_shift() {
        let fs = 1.25e6;
        let n = 512;
        let template = create_template(20e-6, 80e-6, fs, n, 128).unwrap();
        let psd = white_psd(n, fs, 1.0e-9);
        let filter = OptimumFilter::new(&template, &psd, n).unwrap();

        let amplitude = 3.2e-2;
        let shift = 40;
        let mut data = vec![0.0; n];
        for (i, &t) in template.iter().enumerate() {
            data[(i + shift) % n] = amplitude * t;
        }
        let amps = filter.filter_block(&data).unwrap();
        let (peak_idx, peak) = amps
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(peak_idx, shift);
        assert_relative_eq!(*peak, amplitude, max_relative = 1e-6);
    }

    #[test]
    fn test_filter_ignores_dc_offset() {
        let fs = 1.25e6;
        let n = 512;
        let template = create_template(20e-6, 80e-6, fs, n, 128).unwrap();
        let psd = white_psd(n, fs, 1.0e-9);
        let filter = OptimumFilter::new(&template, &psd, n).unwrap();

        let flat = vec![0.7; n];
        let amps = filter.filter_block(&flat).unwrap();
        for &a in &amps {
            assert_relative_eq!(a, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_filter_rejects_mismatched_block() {
        let fs = 1.25e6;
        let n = 256;
        let template = create_template(20e-6, 80e-6, fs, n, 64).unwrap();
        let psd = white_psd(n, fs, 1.0e-9);
        let filter = OptimumFilter::new(&template, &psd, n).unwrap();
        let long = vec![0.0; n + 1];
        assert!(filter.filter_block(&long).is_err());
        assert!(OptimumFilter::new(&template, &psd, n - 1).is_err());
    }

    #[test]
    fn test_sigma_scales_with_noise_level() {
        let fs = 1.25e6;
        let n = 256;
        let template = create_template(20e-6, 80e-6, fs, n, 64).unwrap();
        let quiet = OptimumFilter::new(&template, &white_psd(n, fs, 1.0e-9), n).unwrap();
        let loud = OptimumFilter::new(&template, &white_psd(n, fs, 4.0e-9), n).unwrap();
        assert_relative_eq!(
            loud.sigma_amplitude() / quiet.sigma_amplitude(),
            2.0,
            max_relative = 1e-9
        );
    }
}
