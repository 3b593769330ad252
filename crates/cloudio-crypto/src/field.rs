//! Prime field arithmetic GF(p) over arbitrary-precision integers
//!
//! The default modulus is a fixed prime with 2^256 < p < 2^257, so every
//! 256-bit secret is a valid field element. Smaller moduli are accepted so the
//! arithmetic can be exercised with hand-checkable numbers.
//!
//! Mixing elements of different fields is a programming error and panics.

use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::{Arc, LazyLock};

use num_bigint::{BigInt, BigUint};
use num_traits::{One, Zero};

/// Decimal form of the default field prime.
pub const FIELD_PRIME: &str =
    "231584178474632390847141970017375815706539969331281128078915168015826259277639";

/// Big-endian byte width needed to hold any element of the default field.
pub const FIELD_ELEMENT_BYTES: usize = 33;

static DEFAULT_MODULUS: LazyLock<Arc<BigUint>> = LazyLock::new(|| {
    Arc::new(
        BigUint::parse_bytes(FIELD_PRIME.as_bytes(), 10)
            .expect("FIELD_PRIME is a valid decimal literal"),
    )
});

/// Shared handle to the default field prime.
pub fn default_modulus() -> Arc<BigUint> {
    Arc::clone(&DEFAULT_MODULUS)
}

/// An integer reduced modulo a prime.
#[derive(Clone, Debug)]
pub struct FieldElement {
    value: BigUint,
    modulus: Arc<BigUint>,
}

impl FieldElement {
    pub fn new(value: BigUint, modulus: Arc<BigUint>) -> Self {
        let value = value % modulus.as_ref();
        Self { value, modulus }
    }

    pub fn from_u64(value: u64, modulus: Arc<BigUint>) -> Self {
        Self::new(BigUint::from(value), modulus)
    }

    /// Element of the default field from big-endian bytes.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        Self::new(BigUint::from_bytes_be(bytes), default_modulus())
    }

    pub fn zero(modulus: Arc<BigUint>) -> Self {
        Self {
            value: BigUint::zero(),
            modulus,
        }
    }

    pub fn one(modulus: Arc<BigUint>) -> Self {
        Self::new(BigUint::one(), modulus)
    }

    pub fn value(&self) -> &BigUint {
        &self.value
    }

    pub fn modulus(&self) -> &Arc<BigUint> {
        &self.modulus
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Multiplicative inverse via the extended Euclidean algorithm.
    ///
    /// `None` for the zero element (or a non-prime modulus sharing a factor).
    pub fn inverse(&self) -> Option<Self> {
        mod_inverse(&self.value, &self.modulus).map(|value| Self {
            value,
            modulus: Arc::clone(&self.modulus),
        })
    }

    /// `self / rhs`, or `None` when `rhs` is zero.
    pub fn checked_div(&self, rhs: &Self) -> Option<Self> {
        self.assert_same_field(rhs);
        rhs.inverse().map(|inv| self * &inv)
    }

    /// Square-and-multiply exponentiation.
    pub fn pow(&self, mut exp: u64) -> Self {
        let mut base = self.clone();
        let mut acc = Self::one(Arc::clone(&self.modulus));
        while exp > 0 {
            if exp & 1 == 1 {
                acc = &acc * &base;
            }
            base = &base * &base;
            exp >>= 1;
        }
        acc
    }

    /// Fixed-width big-endian encoding, `None` if the value needs more bytes.
    pub fn to_bytes_be_padded(&self, width: usize) -> Option<Vec<u8>> {
        let raw = self.value.to_bytes_be();
        if self.value.is_zero() {
            return Some(vec![0u8; width]);
        }
        if raw.len() > width {
            return None;
        }
        let mut out = vec![0u8; width - raw.len()];
        out.extend_from_slice(&raw);
        Some(out)
    }

    fn assert_same_field(&self, other: &Self) {
        assert!(
            Arc::ptr_eq(&self.modulus, &other.modulus) || self.modulus == other.modulus,
            "field elements from different fields: {} != {}",
            self.modulus,
            other.modulus
        );
    }
}

fn mod_inverse(a: &BigUint, p: &BigUint) -> Option<BigUint> {
    if a.is_zero() {
        return None;
    }
    let p_int = BigInt::from(p.clone());
    let (mut old_r, mut r) = (BigInt::from(a.clone()), p_int.clone());
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());

    while !r.is_zero() {
        let q = &old_r / &r;
        let next_r = &old_r - &q * &r;
        old_r = std::mem::replace(&mut r, next_r);
        let next_s = &old_s - &q * &s;
        old_s = std::mem::replace(&mut s, next_s);
    }

    if !old_r.is_one() {
        return None;
    }
    (((old_s % &p_int) + &p_int) % &p_int).to_biguint()
}

impl PartialEq for FieldElement {
    fn eq(&self, other: &Self) -> bool {
        self.assert_same_field(other);
        self.value == other.value
    }
}

impl Eq for FieldElement {}

impl PartialEq<u64> for FieldElement {
    fn eq(&self, other: &u64) -> bool {
        BigUint::from(*other) % self.modulus.as_ref() == self.value
    }
}

impl std::fmt::Display for FieldElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<'a> Add<&'a FieldElement> for &FieldElement {
    type Output = FieldElement;

    fn add(self, rhs: &'a FieldElement) -> FieldElement {
        self.assert_same_field(rhs);
        FieldElement::new(&self.value + &rhs.value, Arc::clone(&self.modulus))
    }
}

impl<'a> Sub<&'a FieldElement> for &FieldElement {
    type Output = FieldElement;

    fn sub(self, rhs: &'a FieldElement) -> FieldElement {
        self.assert_same_field(rhs);
        let lifted = &self.value + self.modulus.as_ref();
        FieldElement::new(lifted - &rhs.value, Arc::clone(&self.modulus))
    }
}

impl<'a> Mul<&'a FieldElement> for &FieldElement {
    type Output = FieldElement;

    fn mul(self, rhs: &'a FieldElement) -> FieldElement {
        self.assert_same_field(rhs);
        FieldElement::new(&self.value * &rhs.value, Arc::clone(&self.modulus))
    }
}

impl<'a> Div<&'a FieldElement> for &FieldElement {
    type Output = FieldElement;

    /// Panics on division by zero; use [`FieldElement::checked_div`] for data-driven divisors.
    fn div(self, rhs: &'a FieldElement) -> FieldElement {
        self.checked_div(rhs)
            .expect("division by the zero field element")
    }
}

impl Neg for &FieldElement {
    type Output = FieldElement;

    fn neg(self) -> FieldElement {
        FieldElement::new(
            self.modulus.as_ref() - &self.value,
            Arc::clone(&self.modulus),
        )
    }
}

macro_rules! forward_owned_binop {
    ($($trait:ident :: $method:ident),*) => {$(
        impl $trait<FieldElement> for FieldElement {
            type Output = FieldElement;

            fn $method(self, rhs: FieldElement) -> FieldElement {
                (&self).$method(&rhs)
            }
        }

        impl<'a> $trait<&'a FieldElement> for FieldElement {
            type Output = FieldElement;

            fn $method(self, rhs: &'a FieldElement) -> FieldElement {
                (&self).$method(rhs)
            }
        }
    )*};
}

forward_owned_binop!(Add::add, Sub::sub, Mul::mul, Div::div);

impl Neg for FieldElement {
    type Output = FieldElement;

    fn neg(self) -> FieldElement {
        -&self
    }
}
