//! Shamir threshold secret sharing over GF(p)
//!
//! A 256-bit secret becomes the constant term of a random degree-`t`
//! polynomial; share `i` is the point `(i, P(i))`. Any `t + 1` distinct shares
//! reconstruct the secret by Lagrange interpolation at `x = 0`, while `t` or
//! fewer reveal nothing about it (coefficients are uniform over the field and
//! drawn from the OS CSPRNG).
//!
//! Every share carries its threshold. The threshold and the share index are
//! each encoded in a single byte, which caps both at 127.

use std::collections::HashSet;
use std::sync::Arc;

use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::field::{default_modulus, FieldElement, FIELD_ELEMENT_BYTES};
use crate::polynomial::Polynomial;

/// Size of a shareable secret in bytes.
pub const SECRET_SIZE: usize = 32;

/// Largest share count, and exclusive upper bound for the threshold.
pub const MAX_SHARES: u8 = 127;

/// Encoded share length: index byte, threshold byte, big-endian y.
const ENCODED_SHARE_LEN: usize = 2 + FIELD_ELEMENT_BYTES;

/// One point on the sharing polynomial, tagged with the split's threshold.
///
/// `Debug` redacts `y`; use [`Share::to_hex`] to export a share deliberately.
#[derive(Clone, PartialEq, Eq)]
pub struct Share {
    x: u8,
    y: FieldElement,
    threshold: u8,
}

impl Share {
    /// Construct a share of the default field, validating every component.
    pub fn new(x: u8, y: BigUint, threshold: u8) -> CryptoResult<Self> {
        if x == 0 || x > MAX_SHARES {
            return Err(CryptoError::InvalidShareEncoding(format!(
                "share index {x} outside 1..={MAX_SHARES}"
            )));
        }
        if threshold == 0 || threshold >= MAX_SHARES {
            return Err(CryptoError::InvalidShareEncoding(format!(
                "threshold {threshold} outside 1..{MAX_SHARES}"
            )));
        }
        let modulus = default_modulus();
        if &y >= modulus.as_ref() {
            return Err(CryptoError::InvalidShareEncoding(
                "share value is not a field element".into(),
            ));
        }
        Ok(Self {
            x,
            y: FieldElement::new(y, modulus),
            threshold,
        })
    }

    pub fn x(&self) -> u8 {
        self.x
    }

    pub fn y(&self) -> &FieldElement {
        &self.y
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// `[x][t][y: 33 bytes big-endian]`, hex-encoded.
    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(ENCODED_SHARE_LEN);
        bytes.push(self.x);
        bytes.push(self.threshold);
        // y < p < 2^264, so it never needs more than FIELD_ELEMENT_BYTES.
        let y = self.y.value().to_bytes_be();
        bytes.resize(ENCODED_SHARE_LEN - y.len(), 0);
        bytes.extend_from_slice(&y);
        hex::encode(bytes)
    }

    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| CryptoError::InvalidShareEncoding(format!("hex decode: {e}")))?;
        if bytes.len() != ENCODED_SHARE_LEN {
            return Err(CryptoError::InvalidShareEncoding(format!(
                "expected {ENCODED_SHARE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Self::new(bytes[0], BigUint::from_bytes_be(&bytes[2..]), bytes[1])
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("x", &self.x)
            .field("threshold", &self.threshold)
            .field("y", &"[REDACTED]")
            .finish()
    }
}

/// Check `0 < t < 127` and `t + 1 <= n <= 127`.
pub fn validate_parameters(threshold: u8, shares: u8) -> CryptoResult<()> {
    if threshold == 0 {
        return Err(CryptoError::InvalidThreshold(
            "threshold must be at least 1".into(),
        ));
    }
    if threshold >= MAX_SHARES {
        return Err(CryptoError::InvalidThreshold(format!(
            "threshold {threshold} must be below {MAX_SHARES}"
        )));
    }
    if shares > MAX_SHARES {
        return Err(CryptoError::InvalidThreshold(format!(
            "share count {shares} exceeds {MAX_SHARES}"
        )));
    }
    if (shares as usize) < threshold as usize + 1 {
        return Err(CryptoError::InvalidThreshold(format!(
            "{shares} shares cannot satisfy threshold {threshold} (need at least {})",
            threshold as usize + 1
        )));
    }
    Ok(())
}

/// Split a 32-byte secret into `shares` shares, any `threshold + 1` of which
/// reconstruct it.
///
/// The intermediate polynomial is dropped before returning, but its
/// big-integer coefficients are not zeroized.
pub fn split_secret(
    secret: &[u8; SECRET_SIZE],
    threshold: u8,
    shares: u8,
) -> CryptoResult<Vec<Share>> {
    split_secret_with_rng(secret, threshold, shares, &mut OsRng)
}

/// [`split_secret`] with an explicit RNG.
pub fn split_secret_with_rng<R: RngCore + CryptoRng>(
    secret: &[u8; SECRET_SIZE],
    threshold: u8,
    shares: u8,
    rng: &mut R,
) -> CryptoResult<Vec<Share>> {
    validate_parameters(threshold, shares)?;

    let constant = FieldElement::from_bytes_be(secret);
    let poly = Polynomial::random_with_secret(constant, threshold as usize, rng);

    let out = (1..=shares)
        .map(|x| Share {
            x,
            y: poly.evaluate(x as u64),
            threshold,
        })
        .collect();

    tracing::debug!(threshold, shares, "split secret");
    Ok(out)
}

/// Reconstruct the secret from at least `t + 1` shares of one split.
///
/// Only the first `t + 1` shares are used.
pub fn recover_secret(shares: &[Share]) -> CryptoResult<Zeroizing<[u8; SECRET_SIZE]>> {
    let first = shares.first().ok_or(CryptoError::InsufficientShares {
        have: 0,
        need: 2,
    })?;
    let threshold = first.threshold;

    if let Some(other) = shares.iter().find(|s| s.threshold != threshold) {
        return Err(CryptoError::ThresholdMismatch {
            expected: threshold,
            found: other.threshold,
        });
    }

    let need = threshold as usize + 1;
    if shares.len() < need {
        return Err(CryptoError::InsufficientShares {
            have: shares.len(),
            need,
        });
    }

    let mut seen = HashSet::with_capacity(need);
    let points: Vec<(u64, FieldElement)> = shares[..need]
        .iter()
        .map(|s| {
            if seen.insert(s.x) {
                Ok((s.x as u64, s.y.clone()))
            } else {
                Err(CryptoError::DuplicateShareIndex(u64::from(s.x)))
            }
        })
        .collect::<CryptoResult<_>>()?;

    let value = lagrange_at_zero(&points)?;
    let bytes = value
        .to_bytes_be_padded(SECRET_SIZE)
        .ok_or(CryptoError::SecretOutOfRange)?;

    let mut secret = Zeroizing::new([0u8; SECRET_SIZE]);
    secret.copy_from_slice(&bytes);
    Ok(secret)
}

/// Evaluate the unique interpolating polynomial through `points` at `x = 0`:
/// `sum_i y_i * prod_{j != i} x_j / (x_j - x_i)`.
///
/// Makes no threshold check; with fewer points than the split's `t + 1` the
/// result is unrelated to the secret.
pub fn lagrange_at_zero(points: &[(u64, FieldElement)]) -> CryptoResult<FieldElement> {
    let (_, first_y) = points.first().ok_or(CryptoError::InsufficientShares {
        have: 0,
        need: 1,
    })?;
    let modulus = Arc::clone(first_y.modulus());
    let xs: Vec<FieldElement> = points
        .iter()
        .map(|(x, _)| FieldElement::from_u64(*x, Arc::clone(&modulus)))
        .collect();

    let mut acc = FieldElement::zero(Arc::clone(&modulus));
    for (i, (x_i, y_i)) in points.iter().enumerate() {
        let mut basis = FieldElement::one(Arc::clone(&modulus));
        for (j, x_j) in xs.iter().enumerate() {
            if i == j {
                continue;
            }
            let denom = x_j - &xs[i];
            let term = x_j
                .checked_div(&denom)
                .ok_or(CryptoError::DuplicateShareIndex(*x_i))?;
            basis = &basis * &term;
        }
        acc = &acc + &(y_i * &basis);
    }
    Ok(acc)
}
