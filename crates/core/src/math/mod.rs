//! Exact-rational helpers shared by the evaluator and the market.
//!
//! All price and fee math runs on [`BigRational`]; only the geometric-mean
//! root goes through floating point and is read back exactly.

use crate::{Error, Result};
use ethers::types::U256;
use num_bigint::{BigInt, Sign};
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};

/// Scale applied to rate ratios before the fairness statistic is taken
pub const RATE_RATIO_SCALE: u64 = 10_000;

/// Lossless U256 -> rational
pub fn u256_to_rat(value: U256) -> BigRational {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    BigRational::from_integer(BigInt::from_bytes_be(Sign::Plus, &bytes))
}

/// Floors a non-negative rational into a U256
pub fn rat_to_u256(value: &BigRational) -> Result<U256> {
    if value.is_negative() {
        return Err(Error::Arithmetic(format!("negative amount {value}")));
    }
    let int = value.floor().to_integer();
    let (_, bytes) = int.to_bytes_be();
    if bytes.len() > 32 {
        return Err(Error::Arithmetic(format!("amount {int} overflows uint256")));
    }
    Ok(U256::from_big_endian(&bytes))
}

/// Exact rational form of a configured fraction
pub fn fraction_from_f64(value: f64) -> Result<BigRational> {
    BigRational::from_float(value)
        .ok_or_else(|| Error::ConfigError(format!("{value} is not a finite number")))
}

/// n-th root of a positive rational.
///
/// A value of exactly one returns exactly one, so balanced rings are left
/// untouched by the reduced rate.
pub fn nth_root(value: &BigRational, n: usize) -> Result<BigRational> {
    if n == 0 {
        return Err(Error::Arithmetic("zeroth root".to_string()));
    }
    if !value.is_positive() {
        return Err(Error::Arithmetic(format!("root of non-positive value {value}")));
    }
    if value.is_one() {
        return Ok(BigRational::one());
    }

    let as_float = value
        .to_f64()
        .ok_or_else(|| Error::Arithmetic(format!("{value} has no float form")))?;
    let root = as_float.powf(1.0 / n as f64);
    BigRational::from_float(root)
        .filter(|r| r.is_positive())
        .ok_or_else(|| Error::Arithmetic(format!("root of {value} out of range")))
}

/// Coefficient-of-variation-squared of scaled rate ratios.
///
/// `sum((r - avg)^2) * scale / avg * scale / avg / (n - 1)`, in integer
/// arithmetic. Depends only on the multiset of ratios.
pub fn cv_square(rate_ratios: &[BigInt], scale: u64) -> Result<BigInt> {
    let n = rate_ratios.len();
    if n < 2 {
        return Err(Error::InsufficientRingLength(n));
    }

    let count = BigInt::from(n);
    let sum: BigInt = rate_ratios.iter().sum();
    let avg = &sum / &count;
    if avg.is_zero() {
        return Err(Error::Arithmetic("mean rate ratio is zero".to_string()));
    }

    let mut cvs = BigInt::zero();
    for ratio in rate_ratios {
        let diff = ratio - &avg;
        cvs += &diff * &diff;
    }

    let scale = BigInt::from(scale);
    cvs = cvs * &scale / &avg * &scale / &avg / (count - BigInt::one());
    Ok(cvs)
}
