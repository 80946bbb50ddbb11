//! Pulse template construction.

use crate::{Error, Result};

/// Builds a double-exponential pulse template.
///
/// The pulse is `exp(-t/fall) - exp(-t/rise)` for `t >= 0` and zero
/// before, with `t` measured from the pretrigger mark, sampled at
/// `sample_rate` over `nb_samples` points and peak-normalized to 1.
/// Pure function, no I/O.
///
/// # Errors
/// Returns [`Error::Config`] for non-positive times or rates, for
/// `rise_time >= fall_time`, or for a pretrigger outside the trace.
pub fn create_template(
    rise_time: f64,
    fall_time: f64,
    sample_rate: f64,
    nb_samples: usize,
    nb_samples_pretrigger: usize,
) -> Result<Vec<f64>> {
    if rise_time <= 0.0 || fall_time <= 0.0 {
        return Err(Error::Config(
            "rise and fall times must be positive".to_string(),
        ));
    }
    if rise_time >= fall_time {
        return Err(Error::Config(format!(
            "rise time {rise_time} must be below fall time {fall_time}"
        )));
    }
    if sample_rate <= 0.0 {
        return Err(Error::Config("sample rate must be positive".to_string()));
    }
    if nb_samples == 0 || nb_samples_pretrigger >= nb_samples {
        return Err(Error::Config(format!(
            "pretrigger {nb_samples_pretrigger} must lie inside the {nb_samples}-sample trace"
        )));
    }

    let mut template = vec![0.0; nb_samples];
    #[allow(clippy::cast_precision_loss)]
    for (i, value) in template.iter_mut().enumerate().skip(nb_samples_pretrigger) {
        let t = (i - nb_samples_pretrigger) as f64 / sample_rate;
        *value = (-t / fall_time).exp() - (-t / rise_time).exp();
    }
    let peak = template.iter().copied().fold(f64::MIN, f64::max);
    if peak <= 0.0 {
        return Err(Error::Config(
            "template peak vanished; trace too short for the given time constants".to_string(),
        ));
    }
    for value in &mut template {
        *value /= peak;
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_template_zero_before_pretrigger_and_peaks_at_one() {
        let template = create_template(20e-6, 80e-6, 1.25e6, 512, 128).unwrap();
        assert_eq!(template.len(), 512);
        for &v in &template[..128] {
            assert_eq!(v, 0.0);
        }
        // t = 0 gives exp(0) - exp(0) = 0 at the pretrigger mark itself
        assert_eq!(template[128], 0.0);
        let peak = template.iter().copied().fold(f64::MIN, f64::max);
        assert_relative_eq!(peak, 1.0);
        assert!(template[129] > 0.0);
    }

    #[test]
    fn test_template_rejects_bad_parameters() {
        assert!(create_template(80e-6, 20e-6, 1.25e6, 512, 128).is_err());
        assert!(create_template(0.0, 80e-6, 1.25e6, 512, 128).is_err());
        assert!(create_template(20e-6, 80e-6, 0.0, 512, 128).is_err());
        assert!(create_template(20e-6, 80e-6, 1.25e6, 512, 512).is_err());
    }
}
