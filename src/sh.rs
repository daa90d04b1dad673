//! Even-order real spherical harmonics
//!
//! Basis conventions match the usual diffusion-MRI SH series: only even
//! harmonic bands are stored, coefficients are real, and the flat index
//! of (l, m) is l(l+1)/2 + m. The associated Legendre functions are
//! evaluated with a fully normalised recurrence so high orders stay
//! stable without explicit factorials.

use std::f64::consts::PI;

/// Number of even-order coefficients for harmonic order lmax
pub fn n_for_l(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 2) / 2
}

/// Largest even harmonic order representable with n coefficients
pub fn l_for_n(n: usize) -> usize {
    let mut l = 0usize;
    while n_for_l(l + 2) <= n {
        l += 2;
    }
    l
}

/// Flat index of harmonic (l, m), l even, -l <= m <= l
pub fn index(l: usize, m: i64) -> usize {
    ((l * (l + 1) / 2) as i64 + m) as usize
}

/// Normalised associated Legendre values P̄_l^m(cos θ) for fixed m,
/// all l in [m, lmax], written into `out[l]` for l >= m.
///
/// Normalisation includes the sqrt((2l+1)/4π (l-m)!/(l+m)!) factor and
/// the Condon-Shortley phase, so real SH values follow directly.
fn legendre_sph(out: &mut [f64], lmax: usize, m: usize, cos_theta: f64) {
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();

    // Sectoral seed P̄_m^m
    let mut pmm = (1.0 / (4.0 * PI)).sqrt();
    for k in 1..=m {
        pmm *= -sin_theta * ((2 * k + 1) as f64 / (2 * k) as f64).sqrt();
    }
    out[m] = pmm;
    if lmax == m {
        return;
    }

    // P̄_{m+1}^m
    let mut prev2 = pmm;
    let mut prev1 = ((2 * m + 3) as f64).sqrt() * cos_theta * pmm;
    out[m + 1] = prev1;

    for l in (m + 2)..=lmax {
        let l2 = (l * l) as f64;
        let m2 = (m * m) as f64;
        let a = ((4.0 * l2 - 1.0) / (l2 - m2)).sqrt();
        let lm1 = ((l - 1) * (l - 1)) as f64;
        let b = ((lm1 - m2) / (4.0 * lm1 - 1.0)).sqrt();
        let cur = a * (cos_theta * prev1 - b * prev2);
        out[l] = cur;
        prev2 = prev1;
        prev1 = cur;
    }
}

/// Evaluate the even-order real SH basis at a direction
///
/// Returns the length-`n_for_l(lmax)` row vector whose dot product with
/// a coefficient vector gives the SH series value along `dir`. A zero
/// direction (b=0 acquisition) yields the isotropic l=0-only row.
pub fn delta(dir: [f64; 3], lmax: usize) -> Vec<f64> {
    let n = n_for_l(lmax);
    let mut row = vec![0.0; n];

    let norm = (dir[0] * dir[0] + dir[1] * dir[1] + dir[2] * dir[2]).sqrt();
    if norm < 1e-12 {
        row[0] = 0.5 / PI.sqrt();
        return row;
    }
    let cos_theta = dir[2] / norm;
    let phi = dir[1].atan2(dir[0]);

    let mut plm = vec![0.0; lmax + 1];
    let sqrt2 = std::f64::consts::SQRT_2;

    for m in 0..=lmax {
        legendre_sph(&mut plm, lmax, m, cos_theta);
        let (sin_mphi, cos_mphi) = (m as f64 * phi).sin_cos();
        let mut l = if m % 2 == 0 { m } else { m + 1 };
        while l <= lmax {
            if m == 0 {
                row[index(l, 0)] = plm[l];
            } else {
                row[index(l, m as i64)] = sqrt2 * plm[l] * cos_mphi;
                row[index(l, -(m as i64))] = sqrt2 * plm[l] * sin_mphi;
            }
            l += 2;
        }
    }
    row
}
