//! Slice sensitivity profile
//!
//! 1-D symmetric kernel modelling through-slice signal mixing during
//! slice excitation. Evaluated at integer offsets from the slice centre
//! (in units of the slice spacing); weights are normalised to sum to 1.

use crate::error::{SvrError, SvrResult};

/// Symmetric 1-D slice profile with support radius `n`
#[derive(Debug, Clone)]
pub struct Ssp {
    values: Vec<f64>,
    n: i64,
}

impl Ssp {
    /// Gaussian profile with the given FWHM in units of slice spacing
    ///
    /// Support radius is 3 standard deviations, rounded up (at least 1).
    pub fn gaussian(fwhm: f64) -> SvrResult<Self> {
        if !fwhm.is_finite() || fwhm <= 0.0 {
            return Err(SvrError::InvalidArgument(format!(
                "slice profile FWHM must be positive, got {}", fwhm
            )));
        }
        let sigma = fwhm / (8.0 * std::f64::consts::LN_2).sqrt();
        let n = ((3.0 * sigma).ceil() as i64).max(1);
        let values: Vec<f64> = (-n..=n)
            .map(|s| (-0.5 * (s as f64 / sigma).powi(2)).exp())
            .collect();
        Ok(Self::normalised(values, n))
    }

    /// Profile from explicitly sampled values (odd length, centred)
    pub fn from_vector(values: Vec<f64>) -> SvrResult<Self> {
        if values.is_empty() || values.len() % 2 == 0 {
            return Err(SvrError::InvalidArgument(format!(
                "sampled slice profile must have odd length, got {}", values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(SvrError::InvalidArgument(
                "sampled slice profile must be finite and non-negative".into(),
            ));
        }
        let n = (values.len() / 2) as i64;
        if values.iter().sum::<f64>() <= 0.0 {
            return Err(SvrError::InvalidArgument("slice profile sums to zero".into()));
        }
        Ok(Self::normalised(values, n))
    }

    fn normalised(mut values: Vec<f64>, n: i64) -> Self {
        let sum: f64 = values.iter().sum();
        for v in &mut values {
            *v /= sum;
        }
        Ssp { values, n }
    }

    /// Support radius: weights are non-zero only for offsets in [-n, n]
    pub fn radius(&self) -> i64 {
        self.n
    }

    /// Weight at integer offset `s` from the slice centre
    pub fn value(&self, s: i64) -> f64 {
        if s < -self.n || s > self.n {
            0.0
        } else {
            self.values[(s + self.n) as usize]
        }
    }
}

impl Default for Ssp {
    /// Gaussian with FWHM of one slice spacing
    fn default() -> Self {
        Ssp::gaussian(1.0).expect("unit FWHM profile is always valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_normalised() {
        let ssp = Ssp::gaussian(1.5).unwrap();
        let n = ssp.radius();
        let sum: f64 = (-n..=n).map(|s| ssp.value(s)).sum();
        assert!((sum - 1.0).abs() < 1e-12, "profile should sum to 1, got {}", sum);
    }

    #[test]
    fn test_gaussian_symmetric_peaked() {
        let ssp = Ssp::gaussian(2.0).unwrap();
        for s in 1..=ssp.radius() {
            assert!((ssp.value(s) - ssp.value(-s)).abs() < 1e-15);
            assert!(ssp.value(s) < ssp.value(s - 1), "profile should decay from centre");
        }
    }

    #[test]
    fn test_default_radius() {
        let ssp = Ssp::default();
        assert_eq!(ssp.radius(), 2);
    }

    #[test]
    fn test_outside_support_zero() {
        let ssp = Ssp::gaussian(1.0).unwrap();
        let n = ssp.radius();
        assert_eq!(ssp.value(n + 1), 0.0);
        assert_eq!(ssp.value(-n - 1), 0.0);
    }

    #[test]
    fn test_from_vector() {
        let ssp = Ssp::from_vector(vec![1.0, 2.0, 1.0]).unwrap();
        assert_eq!(ssp.radius(), 1);
        assert!((ssp.value(0) - 0.5).abs() < 1e-15);
        assert!((ssp.value(1) - 0.25).abs() < 1e-15);
        assert!((ssp.value(-1) - 0.25).abs() < 1e-15);
    }

    #[test]
    fn test_from_vector_even_length_rejected() {
        assert!(Ssp::from_vector(vec![1.0, 1.0]).is_err());
        assert!(Ssp::from_vector(vec![]).is_err());
    }

    #[test]
    fn test_from_vector_negative_rejected() {
        assert!(Ssp::from_vector(vec![0.5, -1.0, 0.5]).is_err());
    }

    #[test]
    fn test_bad_fwhm_rejected() {
        assert!(Ssp::gaussian(0.0).is_err());
        assert!(Ssp::gaussian(-1.0).is_err());
        assert!(Ssp::gaussian(f64::NAN).is_err());
    }
}
