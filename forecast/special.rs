//! Special functions shared by the likelihoods and the closed-form predictions.
//!
//! `ln_gamma` and `ln_beta` come from `statrs`. The Gauss hypergeometric function is
//! evaluated from its power series, which is all the BG/NBD formulas need:
//! every argument they pass has the form `t / (alpha + T + t)` and therefore
//! lies strictly inside the unit interval. Its third parameter can be
//! negative (`a + b − 1` for a customer without repeat purchases), in which
//! case the function itself can be negative; [`signed_ln_hyp2f1`] keeps the
//! sign next to the logarithm of the magnitude.

pub use statrs::function::beta::ln_beta;
pub use statrs::function::gamma::ln_gamma;
use thiserror::Error;

/// Upper bound on the number of series terms before giving up.
const MAX_SERIES_TERMS: usize = 200_000;

/// Relative size below which a series term no longer changes the sum.
const SERIES_TOLERANCE: f64 = 1e-15;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HypergeometricError {
    #[error("argument z = {0} is outside [0, 1)")]
    OutOfDomain(f64),

    #[error("parameters are not finite (a={a}, b={b}, c={c})")]
    NonFiniteParameter { a: f64, b: f64, c: f64 },

    #[error("c = {0} is a non-positive integer, where the series has a pole")]
    Pole(f64),

    #[error("series overflows (a={a}, b={b}, c={c}, z={z})")]
    Overflow { a: f64, b: f64, c: f64, z: f64 },

    #[error("series did not settle within {terms} terms (a={a}, b={b}, c={c}, z={z})")]
    NotConverged {
        a: f64,
        b: f64,
        c: f64,
        z: f64,
        terms: usize,
    },
}

/// Gauss hypergeometric function `₂F₁(a, b; c; z)` for `0 ≤ z < 1`.
pub fn hyp2f1(a: f64, b: f64, c: f64, z: f64) -> Result<f64, HypergeometricError> {
    if !(0.0..1.0).contains(&z) {
        return Err(HypergeometricError::OutOfDomain(z));
    }
    if !a.is_finite() || !b.is_finite() || !c.is_finite() {
        return Err(HypergeometricError::NonFiniteParameter { a, b, c });
    }
    if c <= 0.0 && c.fract() == 0.0 {
        return Err(HypergeometricError::Pole(c));
    }
    if z == 0.0 {
        return Ok(1.0);
    }

    let mut term = 1.0_f64;
    let mut sum = 1.0_f64;
    for k in 0..MAX_SERIES_TERMS {
        let kf = k as f64;
        term *= (a + kf) * (b + kf) / ((c + kf) * (kf + 1.0)) * z;
        sum += term;
        if !sum.is_finite() {
            return Err(HypergeometricError::Overflow { a, b, c, z });
        }
        if term.abs() <= SERIES_TOLERANCE * sum.abs() {
            return Ok(sum);
        }
    }
    Err(HypergeometricError::NotConverged {
        a,
        b,
        c,
        z,
        terms: MAX_SERIES_TERMS,
    })
}

/// A real number stored as `ln|v|` and its sign.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignedLog {
    pub ln_abs: f64,
    pub negative: bool,
}

impl SignedLog {
    pub fn from_value(value: f64) -> Self {
        Self {
            ln_abs: value.abs().ln(),
            negative: value < 0.0,
        }
    }

    pub fn value(&self) -> f64 {
        let magnitude = self.ln_abs.exp();
        if self.negative { -magnitude } else { magnitude }
    }

    /// `1 − e^ln_scale · v`, without cancellation when the product is near 1.
    pub fn one_minus_scaled(&self, ln_scale: f64) -> f64 {
        let ln_product = self.ln_abs + ln_scale;
        if self.negative {
            1.0 + ln_product.exp()
        } else {
            -ln_product.exp_m1()
        }
    }
}

/// `₂F₁(a, b; c; z)` as a [`SignedLog`].
///
/// Falls back to Euler's transformation
/// `₂F₁(a, b; c; z) = (1 − z)^(c − a − b) ₂F₁(c − a, c − b; c; z)`
/// when the direct series overflows or does not settle, so results beyond
/// the range of `f64` keep a finite logarithm.
pub fn signed_ln_hyp2f1(
    a: f64,
    b: f64,
    c: f64,
    z: f64,
) -> Result<SignedLog, HypergeometricError> {
    match hyp2f1(a, b, c, z) {
        Ok(direct) => Ok(SignedLog::from_value(direct)),
        Err(HypergeometricError::Overflow { .. } | HypergeometricError::NotConverged { .. }) => {
            let transformed = hyp2f1(c - a, c - b, c, z)?;
            let mut result = SignedLog::from_value(transformed);
            result.ln_abs += (c - a - b) * (-z).ln_1p();
            Ok(result)
        }
        Err(e) => Err(e),
    }
}

/// `ln(eˣ + eʸ)` without overflow.
#[inline]
pub fn log_add_exp(x: f64, y: f64) -> f64 {
    let hi = x.max(y);
    if hi == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    hi + ((x - hi).exp() + (y - hi).exp()).ln()
}

/// Logistic function `1 / (1 + e^(−x))`, stable for large `|x|`.
#[inline]
pub fn expit(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hyp2f1_matches_log_identity() {
        // ₂F₁(1, 1; 2; z) = −ln(1 − z) / z
        for &z in &[0.01, 0.2, 0.5, 0.9] {
            let expected = -(1.0_f64 - z).ln() / z;
            assert_relative_eq!(
                hyp2f1(1.0, 1.0, 2.0, z).unwrap(),
                expected,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn hyp2f1_reduces_to_binomial_series_when_b_equals_c() {
        // ₂F₁(a, b; b; z) = (1 − z)^(−a), for positive and negative b alike.
        for &(a, b, z) in &[
            (0.3, 2.5, 0.4),
            (4.2, 1.7, 0.15),
            (12.0, 3.0, 0.6),
            (0.23, -0.12, 0.9),
        ] {
            let expected = (1.0_f64 - z).powf(-a);
            assert_relative_eq!(
                hyp2f1(a, b, b, z).unwrap(),
                expected,
                max_relative = 1e-10
            );
        }
    }

    #[test]
    fn hyp2f1_is_negative_for_small_negative_c() {
        // For −1 < c < 0 < a, b every term after the leading 1 is negative.
        let (a, b, c, z) = (0.234, 0.585, -0.124, 0.9);
        let value = hyp2f1(a, b, c, z).unwrap();
        assert!(value < 0.0, "{value}");

        let signed = signed_ln_hyp2f1(a, b, c, z).unwrap();
        assert!(signed.negative);
        assert_relative_eq!(signed.value(), value, max_relative = 1e-12);
        assert_relative_eq!(
            signed.one_minus_scaled(-0.5),
            1.0 - (-0.5_f64).exp() * value,
            max_relative = 1e-12
        );
    }

    #[test]
    fn euler_transformation_agrees_with_direct_series() {
        let (a, b, c, z) = (2.3, 3.1, 4.7, 0.35);
        let direct = hyp2f1(a, b, c, z).unwrap().ln();
        let euler =
            (c - a - b) * (1.0_f64 - z).ln() + hyp2f1(c - a, c - b, c, z).unwrap().ln();
        assert_relative_eq!(direct, euler, max_relative = 1e-10);

        let signed = signed_ln_hyp2f1(a, b, c, z).unwrap();
        assert!(!signed.negative);
        assert_relative_eq!(signed.ln_abs, direct, max_relative = 1e-12);
    }

    #[test]
    fn one_minus_scaled_keeps_precision_near_one() {
        let signed = SignedLog::from_value(2.0);
        let ln_scale = -(2.0_f64.ln()) + 1e-12;
        assert_relative_eq!(signed.one_minus_scaled(ln_scale), -1e-12, max_relative = 1e-3);
        assert_eq!(SignedLog::from_value(0.0).one_minus_scaled(3.0), 1.0);
    }

    #[test]
    fn hyp2f1_names_the_failure() {
        assert_eq!(
            hyp2f1(1.0, 1.0, 2.0, 1.0),
            Err(HypergeometricError::OutOfDomain(1.0))
        );
        assert_eq!(
            hyp2f1(1.0, 1.0, 2.0, -0.1),
            Err(HypergeometricError::OutOfDomain(-0.1))
        );
        assert_eq!(hyp2f1(1.0, 1.0, -2.0, 0.5), Err(HypergeometricError::Pole(-2.0)));
        assert!(matches!(
            hyp2f1(f64::NAN, 1.0, 2.0, 0.5),
            Err(HypergeometricError::NonFiniteParameter { .. })
        ));
        assert_eq!(hyp2f1(3.0, 4.0, 5.0, 0.0), Ok(1.0));
    }

    #[test]
    fn log_add_exp_is_stable() {
        assert_relative_eq!(log_add_exp(0.0, 0.0), 2.0_f64.ln(), max_relative = 1e-15);
        assert_relative_eq!(log_add_exp(1000.0, 1000.0), 1000.0 + 2.0_f64.ln());
        assert_eq!(log_add_exp(f64::NEG_INFINITY, -3.0), -3.0);
    }

    #[test]
    fn expit_is_symmetric() {
        assert_relative_eq!(expit(0.0), 0.5);
        assert_relative_eq!(expit(3.0) + expit(-3.0), 1.0, max_relative = 1e-15);
        assert!(expit(-800.0) >= 0.0);
        assert_relative_eq!(expit(800.0), 1.0);
    }
}
