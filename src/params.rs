use std::fmt::Write;
use std::sync::Arc;

use feanor_math::integer::*;
use feanor_math::primitive_int::StaticRing;
use feanor_math::ring::*;
use feanor_math::rings::zn::*;

use rand::{Rng, CryptoRng};
use serde::{Serialize, Deserialize};
use tracing::{info, debug, instrument};

use crate::bfv::*;
use crate::codec::{FractionalCodec, PlaintextElement};
use crate::context::{Ciphertext, PublicContext, SecretContext};
use crate::engine::SumStrategy;
use crate::error::{FracError, Result};
use crate::noise_estimator::{NaiveNoiseEstimator, NoiseEstimator};

const ZZbig: BigIntRing = BigIntRing::RING;
const ZZ: StaticRing<i64> = StaticRing::<i64>::RING;

///
/// The largest plaintext modulus we support, measured in bits.
///
pub const MAX_PLAIN_MODULUS_BITS: usize = 30;

///
/// Target security level, following the tables of the homomorphic encryption
/// standard for ternary secrets and error standard deviation `3.2`.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Bits128,
    Bits192,
    Bits256
}

impl SecurityLevel {

    ///
    /// Returns the largest `log2(q)` that achieves this security level for the given
    /// ring degree, or `None` if the ring degree is not covered by the table.
    ///
    pub fn max_coeff_modulus_bits(&self, ring_degree: usize) -> Option<usize> {
        let index = match ring_degree {
            1024 => 0,
            2048 => 1,
            4096 => 2,
            8192 => 3,
            16384 => 4,
            32768 => 5,
            _ => return None
        };
        let table: [usize; 6] = match self {
            SecurityLevel::Bits128 => [27, 54, 109, 218, 438, 881],
            SecurityLevel::Bits192 => [19, 37, 75, 152, 305, 611],
            SecurityLevel::Bits256 => [14, 29, 58, 118, 237, 476]
        };
        return Some(table[index]);
    }

    ///
    /// Splits the maximal coefficient modulus into near-equal factors of at most
    /// [`MAX_RNS_FACTOR_BITS`] bits.
    ///
    pub fn default_coeff_modulus_bits(&self, ring_degree: usize) -> Option<Vec<usize>> {
        let total = self.max_coeff_modulus_bits(ring_degree)?;
        let factor_count = (total - 1) / MAX_RNS_FACTOR_BITS + 1;
        let result = (0..factor_count).map(|i| total / factor_count + if i < total % factor_count { 1 } else { 0 }).collect::<Vec<_>>();
        debug_assert_eq!(total, result.iter().sum::<usize>());
        return Some(result);
    }
}

///
/// How many balanced base-`base` digits are reserved for the integer part
/// and for the fractional part of an encoded value.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingPrecision {
    pub integer_slots: usize,
    pub fraction_slots: usize,
    pub base: u64
}

impl Default for EncodingPrecision {

    fn default() -> Self {
        Self { integer_slots: 64, fraction_slots: 32, base: 3 }
    }
}

impl EncodingPrecision {

    pub fn new(integer_slots: usize, fraction_slots: usize, base: u64) -> Result<Self> {
        let result = Self { integer_slots, fraction_slots, base };
        result.validate()?;
        return Ok(result);
    }

    ///
    /// Checks the precision on its own; whether it fits a ring is checked by [`FractionalCodec::new()`].
    ///
    pub fn validate(&self) -> Result<()> {
        if self.base < 3 || self.base % 2 == 0 {
            return Err(FracError::ParameterInvalid(format!("base must be odd and at least 3, got {}", self.base)));
        }
        if self.base > i32::MAX as u64 {
            return Err(FracError::ParameterInvalid(format!("base {} is too large", self.base)));
        }
        if self.integer_slots == 0 {
            return Err(FracError::ParameterInvalid(format!("at least one integer slot is required")));
        }
        return Ok(());
    }
}

///
/// Configuration of a [`ParameterContext`]. All fields have defaults, so e.g.
/// `{"ring_degree": 4096}` is a valid json configuration.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FracParams {
    pub security_level: SecurityLevel,
    pub ring_degree: usize,
    /// Bit sizes of the RNS factors of `q`; if not given, derived from `security_level`
    pub coeff_modulus_bits: Option<Vec<usize>>,
    pub plain_modulus: u64,
    pub precision: EncodingPrecision,
    pub relin_base_bits: usize,
    pub noise_std_dev: f64
}

impl Default for FracParams {

    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Bits128,
            ring_degree: 2048,
            coeff_modulus_bits: None,
            plain_modulus: 256,
            precision: EncodingPrecision::default(),
            relin_base_bits: 10,
            noise_std_dev: 3.2
        }
    }
}

impl FracParams {

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FracError::ParameterInvalid(format!("malformed configuration: {}", e)))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap()
    }
}

///
/// All public parameters of the scheme, i.e. the rings, the encoding and the noise
/// accounting. Does not contain any key material; keys are created by
/// [`ParameterContext::generate_keys()`].
///
pub struct ParameterContext {
    params: FracParams,
    rns_base: Vec<i64>,
    ciphertext_ring: CiphertextRing,
    multiplication_ring: CiphertextRing,
    codec: FractionalCodec,
    estimator: NaiveNoiseEstimator
}

impl ParameterContext {

    ///
    /// Positional form of [`ParameterContext::new()`], using the plaintext modulus `2^plain_modulus_bits`
    /// and the default coefficient modulus for the security level.
    ///
    pub fn construct(security_level: SecurityLevel, ring_degree: usize, plain_modulus_bits: usize, precision: EncodingPrecision) -> Result<Self> {
        if plain_modulus_bits < 2 || plain_modulus_bits > MAX_PLAIN_MODULUS_BITS {
            return Err(FracError::ParameterInvalid(format!("plaintext modulus must have between 2 and {} bits, got {}", MAX_PLAIN_MODULUS_BITS, plain_modulus_bits)));
        }
        Self::new(FracParams {
            security_level,
            ring_degree,
            plain_modulus: 1 << plain_modulus_bits,
            precision,
            ..FracParams::default()
        })
    }

    #[instrument(skip_all)]
    pub fn new(params: FracParams) -> Result<Self> {
        let N = params.ring_degree;
        if N < 2 || !N.is_power_of_two() {
            return Err(FracError::ParameterInvalid(format!("ring degree must be a power of two, got {}", N)));
        }
        let max_bits = params.security_level.max_coeff_modulus_bits(N).ok_or_else(|| FracError::ParameterInvalid(
            format!("no coefficient modulus known for ring degree {} at {:?}", N, params.security_level)
        ))?;
        let t = params.plain_modulus;
        if t < 2 || t > (1 << MAX_PLAIN_MODULUS_BITS) {
            return Err(FracError::ParameterInvalid(format!("plaintext modulus must be in [2, 2^{}], got {}", MAX_PLAIN_MODULUS_BITS, t)));
        }
        if !(params.noise_std_dev > 0.) || params.noise_std_dev > 1024. {
            return Err(FracError::ParameterInvalid(format!("invalid noise standard deviation {}", params.noise_std_dev)));
        }
        if params.relin_base_bits == 0 || params.relin_base_bits > 30 {
            return Err(FracError::ParameterInvalid(format!("relinearization base must be between 2^1 and 2^30, got 2^{}", params.relin_base_bits)));
        }

        let coeff_modulus_bits = match &params.coeff_modulus_bits {
            Some(bits) => {
                let min_factor_bits = ZZ.abs_log2_ceil(&(2 * N as i64)).unwrap() + 2;
                if bits.is_empty() {
                    return Err(FracError::ParameterInvalid(format!("coefficient modulus chain must not be empty")));
                }
                if let Some(b) = bits.iter().find(|b| **b < min_factor_bits || **b > MAX_RNS_FACTOR_BITS) {
                    return Err(FracError::ParameterInvalid(format!("coefficient modulus factors must have between {} and {} bits, got {}", min_factor_bits, MAX_RNS_FACTOR_BITS, b)));
                }
                let total = bits.iter().sum::<usize>();
                if total > max_bits {
                    return Err(FracError::ParameterInvalid(format!("coefficient modulus of {} bits exceeds the bound of {} bits for ring degree {} at {:?}", total, max_bits, N, params.security_level)));
                }
                bits.clone()
            },
            None => params.security_level.default_coeff_modulus_bits(N).unwrap()
        };

        let rns_base = sample_rns_primes(N, &coeff_modulus_bits, &[]).ok_or_else(|| FracError::ParameterInvalid(
            format!("could not find primes = 1 mod {} of sizes {:?}", 2 * N, coeff_modulus_bits)
        ))?;
        debug!("sampled coefficient modulus primes {:?}", rns_base);

        let codec = FractionalCodec::new(N, t, params.precision)?;
        let ciphertext_ring = create_ciphertext_ring(N, &rns_base);
        let multiplication_ring = create_multiplication_ring(&ciphertext_ring);
        let estimator = NaiveNoiseEstimator::new(params.noise_std_dev);

        let fresh_budget = estimator.noise_budget(&estimator.enc_asym(codec.ring(), &ciphertext_ring));
        if fresh_budget == 0 {
            return Err(FracError::ParameterInvalid(format!("coefficient modulus is too small to hold a fresh encryption with plaintext modulus {}", t)));
        }

        let result = Self { params, rns_base, ciphertext_ring, multiplication_ring, codec, estimator };
        info!("created parameter context with {}", result.summary().trim());
        return Ok(result);
    }

    pub fn params(&self) -> &FracParams {
        &self.params
    }

    pub fn ring_degree(&self) -> usize {
        self.params.ring_degree
    }

    pub fn plain_modulus(&self) -> u64 {
        self.params.plain_modulus
    }

    pub fn precision(&self) -> &EncodingPrecision {
        &self.params.precision
    }

    pub fn rns_base(&self) -> &[i64] {
        &self.rns_base
    }

    ///
    /// The bit length of the full coefficient modulus `q`.
    ///
    pub fn coeff_modulus_bits(&self) -> usize {
        ZZbig.abs_log2_ceil(self.ciphertext_ring.base_ring().modulus()).unwrap()
    }

    pub fn codec(&self) -> &FractionalCodec {
        &self.codec
    }

    pub fn plaintext_ring(&self) -> &PlaintextRing {
        self.codec.ring()
    }

    pub fn ciphertext_ring(&self) -> &CiphertextRing {
        &self.ciphertext_ring
    }

    pub(crate) fn multiplication_ring(&self) -> &CiphertextRing {
        &self.multiplication_ring
    }

    pub(crate) fn estimator(&self) -> &NaiveNoiseEstimator {
        &self.estimator
    }

    ///
    /// The estimated noise budget of the given ciphertext, in bits. This does not
    /// require the secret key, and is a lower bound on the budget that
    /// [`SecretContext::measured_noise_budget()`] reports in almost all cases.
    ///
    pub fn noise_budget(&self, ct: &Ciphertext) -> usize {
        self.estimator.noise_budget(ct.noise())
    }

    ///
    /// The estimated budget of a fresh encryption.
    ///
    pub fn fresh_noise_budget(&self) -> usize {
        self.estimator.noise_budget(&self.estimator.enc_asym(self.plaintext_ring(), &self.ciphertext_ring))
    }

    ///
    /// Both operands of a ciphertext-ciphertext multiplication must have at least this
    /// much noise budget. A multiplication consumes about `log2(t) + log2(N)` bits,
    /// and we leave some margin so that the result is not exhausted.
    ///
    pub fn multiplication_noise_threshold(&self) -> usize {
        let log2_t = ZZ.abs_log2_ceil(&(self.params.plain_modulus as i64)).unwrap();
        let log2_N = ZZ.abs_log2_ceil(&(self.params.ring_degree as i64)).unwrap();
        return log2_t + log2_N + 5;
    }

    ///
    /// Estimates the noise budget of
    /// [`crate::engine::HomomorphicArithmeticEngine::weighted_average()`] on the given
    /// inputs, without performing any homomorphic operation. The additions are grouped
    /// as by the default [`SumStrategy`].
    ///
    pub fn predict_weighted_average_budget(&self, values: &[Ciphertext], weights: &[PlaintextElement], divisor: &PlaintextElement) -> Result<usize> {
        let noise = self.predict_weighted_average_noise(values, weights, divisor, SumStrategy::default())?;
        return Ok(self.estimator.noise_budget(&noise));
    }

    pub(crate) fn predict_weighted_average_noise(&self, values: &[Ciphertext], weights: &[PlaintextElement], divisor: &PlaintextElement, sum_strategy: SumStrategy) -> Result<f64> {
        if values.is_empty() {
            return Err(FracError::InvalidArgument(format!("weighted average of no values")));
        }
        if values.len() != weights.len() {
            return Err(FracError::InvalidArgument(format!("got {} values but {} weights", values.len(), weights.len())));
        }
        let P = self.plaintext_ring();
        let products = values.iter().zip(weights.iter())
            .map(|(ct, w)| self.estimator.hom_mul_plain(P, w.element(), ct.noise()))
            .collect::<Vec<_>>();
        let sum = self.predict_sum_noise(&products, sum_strategy);
        return Ok(self.estimator.hom_mul_plain(P, divisor.element(), &sum));
    }

    ///
    /// Follows the grouping of [`crate::engine::HomomorphicArithmeticEngine::sum_many()`] exactly,
    /// so that the rounding of the floating point noise estimates matches.
    ///
    fn predict_sum_noise(&self, noises: &[f64], sum_strategy: SumStrategy) -> f64 {
        match sum_strategy {
            SumStrategy::Sequential => noises[1..].iter().fold(noises[0], |current, noise| self.estimator.hom_add(&current, noise)),
            SumStrategy::BalancedTree if noises.len() == 1 => noises[0],
            SumStrategy::BalancedTree => {
                let (left, right) = noises.split_at(noises.len() / 2);
                let left = self.predict_sum_noise(left, sum_strategy);
                let right = self.predict_sum_noise(right, sum_strategy);
                self.estimator.hom_add(&left, &right)
            }
        }
    }

    ///
    /// Returns a human-readable description of the parameters.
    ///
    pub fn summary(&self) -> String {
        let mut result = String::new();
        writeln!(result, "/ encryption parameters:").unwrap();
        writeln!(result, "| ring: Z[X]/(X^{} + 1)", self.params.ring_degree).unwrap();
        writeln!(result, "| coeff_modulus: {} bits ({} primes of {:?} bits)",
            self.coeff_modulus_bits(),
            self.rns_base.len(),
            self.rns_base.iter().map(|p| ZZ.abs_log2_ceil(p).unwrap()).collect::<Vec<_>>()
        ).unwrap();
        writeln!(result, "| plain_modulus: {}", self.params.plain_modulus).unwrap();
        writeln!(result, "| noise_standard_deviation: {}", self.params.noise_std_dev).unwrap();
        writeln!(result, "| encoding: {} integer and {} fractional digits in balanced base {}",
            self.params.precision.integer_slots,
            self.params.precision.fraction_slots,
            self.params.precision.base
        ).unwrap();
        writeln!(result, "\\ fresh noise budget: {} bits", self.fresh_noise_budget()).unwrap();
        return result;
    }

    ///
    /// Samples a new key pair, and returns it split by capability. Both contexts keep
    /// a reference to these parameters.
    ///
    #[instrument(skip_all)]
    pub fn generate_keys<R: Rng + CryptoRng>(self: Arc<Self>, mut rng: R) -> (PublicContext, SecretContext) {
        let C = &self.ciphertext_ring;
        let sk = gen_sk(C, &mut rng);
        let pk = gen_pk(C, &mut rng, &sk, self.params.noise_std_dev);
        let rk = gen_rk(C, &mut rng, &sk, self.params.relin_base_bits, self.params.noise_std_dev);
        debug!("generated relinearization key with {} digits", rk.digits());
        return (PublicContext::new(self.clone(), pk, rk), SecretContext::new(self, sk));
    }
}

#[cfg(test)]
use feanor_math::algorithms::miller_rabin::is_prime;

#[test]
fn test_default_coeff_modulus_bits() {
    assert_eq!(Some(vec![27, 27]), SecurityLevel::Bits128.default_coeff_modulus_bits(2048));
    assert_eq!(Some(vec![37, 36, 36]), SecurityLevel::Bits128.default_coeff_modulus_bits(4096));
    assert_eq!(Some(vec![14]), SecurityLevel::Bits256.default_coeff_modulus_bits(1024));
    assert_eq!(Some(881), SecurityLevel::Bits128.default_coeff_modulus_bits(32768).map(|bits| bits.iter().sum()));
    assert_eq!(None, SecurityLevel::Bits192.default_coeff_modulus_bits(512));
}

#[test]
fn test_create_default_context() {
    let context = ParameterContext::new(FracParams::default()).unwrap();
    assert_eq!(2048, context.ring_degree());
    assert_eq!(256, context.plain_modulus());
    assert_eq!(54, context.coeff_modulus_bits());
    assert_eq!(2, context.rns_base().len());
    for p in context.rns_base() {
        assert_eq!(1, p % 4096);
        assert!(is_prime(ZZ, p, 10));
    }
    assert!(context.fresh_noise_budget() >= context.multiplication_noise_threshold());
    assert!(context.summary().contains("plain_modulus: 256"));
}

#[test]
fn test_construct() {
    let context = ParameterContext::construct(SecurityLevel::Bits128, 2048, 8, EncodingPrecision::default()).unwrap();
    assert_eq!(256, context.plain_modulus());
    assert_eq!(24, context.multiplication_noise_threshold());

    assert!(matches!(
        ParameterContext::construct(SecurityLevel::Bits128, 2000, 8, EncodingPrecision::default()),
        Err(FracError::ParameterInvalid(_))
    ));
    assert!(matches!(
        ParameterContext::construct(SecurityLevel::Bits128, 512, 8, EncodingPrecision::default()),
        Err(FracError::ParameterInvalid(_))
    ));
    assert!(matches!(
        ParameterContext::construct(SecurityLevel::Bits128, 2048, 1, EncodingPrecision::default()),
        Err(FracError::ParameterInvalid(_))
    ));
    // plaintext modulus must exceed the base, so that digits are distinct modulo `t`
    assert!(matches!(
        ParameterContext::construct(SecurityLevel::Bits128, 2048, 2, EncodingPrecision { integer_slots: 4, fraction_slots: 4, base: 5 }),
        Err(FracError::ParameterInvalid(_))
    ));
}

#[test]
fn test_invalid_precision() {
    assert!(EncodingPrecision::new(64, 32, 4).is_err());
    assert!(EncodingPrecision::new(0, 32, 3).is_err());
    assert!(EncodingPrecision::new(10, 0, 5).is_ok());
    let params = FracParams {
        ring_degree: 1024,
        precision: EncodingPrecision { integer_slots: 400, fraction_slots: 200, base: 3 },
        ..FracParams::default()
    };
    assert!(matches!(ParameterContext::new(params), Err(FracError::ParameterInvalid(_))));
}

#[test]
fn test_custom_coeff_modulus() {
    let params = FracParams {
        coeff_modulus_bits: Some(vec![30, 24]),
        ..FracParams::default()
    };
    let context = ParameterContext::new(params).unwrap();
    assert_eq!(54, context.coeff_modulus_bits());

    let params = FracParams {
        coeff_modulus_bits: Some(vec![30, 30]),
        ..FracParams::default()
    };
    assert!(matches!(ParameterContext::new(params), Err(FracError::ParameterInvalid(_))));

    let params = FracParams {
        coeff_modulus_bits: Some(vec![54]),
        ..FracParams::default()
    };
    assert!(matches!(ParameterContext::new(params), Err(FracError::ParameterInvalid(_))));
}

#[test]
fn test_params_from_json() {
    let params = FracParams::from_json(r#"{ "ring_degree": 4096, "security_level": "bits192", "plain_modulus": 1024 }"#).unwrap();
    assert_eq!(4096, params.ring_degree);
    assert_eq!(SecurityLevel::Bits192, params.security_level);
    assert_eq!(1024, params.plain_modulus);
    assert_eq!(EncodingPrecision::default(), params.precision);
    assert_eq!(params, FracParams::from_json(&params.to_json()).unwrap());

    assert!(matches!(FracParams::from_json(r#"{ "ring_degree": "large" }"#), Err(FracError::ParameterInvalid(_))));
}
