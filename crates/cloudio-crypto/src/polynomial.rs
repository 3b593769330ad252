//! Polynomials over GF(p) whose constant term carries a secret

use std::sync::Arc;

use num_bigint::{BigUint, RandBigInt};
use rand::{CryptoRng, RngCore};

use crate::field::FieldElement;

/// `P(x) = c0 + c1 x + ... + ct x^t` with `c0` the secret.
///
/// Coefficients live in heap-allocated `BigUint`s, which are not wiped on
/// drop: keep polynomials short-lived. `Debug` prints only the degree.
#[derive(Clone)]
pub struct Polynomial {
    coefficients: Vec<FieldElement>,
}

impl std::fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Polynomial")
            .field("degree", &self.degree())
            .finish_non_exhaustive()
    }
}

impl Polynomial {
    /// Build a degree-`degree` polynomial with the given constant term and
    /// coefficients drawn uniformly from the field using `rng`.
    pub fn random_with_secret<R: RngCore + CryptoRng>(
        secret: FieldElement,
        degree: usize,
        rng: &mut R,
    ) -> Self {
        let modulus = Arc::clone(secret.modulus());
        let mut coefficients = Vec::with_capacity(degree + 1);
        coefficients.push(secret);
        for _ in 0..degree {
            let c = rng.gen_biguint_below(modulus.as_ref());
            coefficients.push(FieldElement::new(c, Arc::clone(&modulus)));
        }
        Self { coefficients }
    }

    /// Polynomial from explicit coefficients, lowest degree first.
    pub fn from_coefficients(coefficients: Vec<FieldElement>) -> Self {
        assert!(!coefficients.is_empty(), "polynomial needs a constant term");
        Self { coefficients }
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    pub fn secret(&self) -> &FieldElement {
        &self.coefficients[0]
    }

    /// Horner evaluation at `x`.
    pub fn evaluate(&self, x: u64) -> FieldElement {
        let modulus = Arc::clone(self.coefficients[0].modulus());
        let x = FieldElement::new(BigUint::from(x), Arc::clone(&modulus));
        self.coefficients
            .iter()
            .rev()
            .fold(FieldElement::zero(modulus), |acc, c| &(&acc * &x) + c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::default_modulus;

    fn fe(v: u64, p: &Arc<BigUint>) -> FieldElement {
        FieldElement::from_u64(v, Arc::clone(p))
    }

    #[test]
    fn test_evaluate_point() {
        let p = Arc::new(BigUint::from(17u32));
        // 13 + 2x + 5x^2
        let poly = Polynomial::from_coefficients(vec![fe(13, &p), fe(2, &p), fe(5, &p)]);
        // P(1) = 20 = 3 (mod 17)
        assert_eq!(poly.evaluate(1), fe(3, &p));
        // P(3) = 64 = 13 (mod 17)
        assert_eq!(poly.evaluate(3), fe(13, &p));
        assert_eq!(poly.evaluate(0), fe(13, &p));
    }

    #[test]
    fn test_random_polynomial_shape() {
        let secret = FieldElement::from_u64(42, default_modulus());
        let poly = Polynomial::random_with_secret(secret.clone(), 4, &mut rand::thread_rng());

        assert_eq!(poly.degree(), 4);
        assert_eq!(poly.secret(), &secret);
        assert_eq!(poly.evaluate(0), secret);
    }

    #[test]
    fn test_debug_omits_coefficients() {
        let secret = FieldElement::from_u64(987_654_321, default_modulus());
        let poly = Polynomial::random_with_secret(secret, 3, &mut rand::thread_rng());
        let rendered = format!("{poly:?}");
        assert!(rendered.contains("degree: 3"));
        assert!(!rendered.contains("987654321"));
    }

    #[test]
    fn test_random_coefficients_differ_between_polynomials() {
        let secret = FieldElement::from_u64(1, default_modulus());
        let a = Polynomial::random_with_secret(secret.clone(), 2, &mut rand::thread_rng());
        let b = Polynomial::random_with_secret(secret, 2, &mut rand::thread_rng());
        assert_ne!(a.evaluate(1), b.evaluate(1));
    }
}
