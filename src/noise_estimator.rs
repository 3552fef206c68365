use feanor_math::integer::*;
use feanor_math::ring::*;
use feanor_math::rings::extension::FreeAlgebraStore;
use feanor_math::rings::zn::*;
use feanor_math::seq::*;

use crate::bfv::{PlaintextRing, CiphertextRing};

///
/// Estimates the noise growth of the BFV operations without access to the secret key.
///
/// The quantity that is tracked is the invariant noise `v`, i.e. the value with
/// `t/q (c0 + c1 s) = m + v + t k`. Decryption is correct as long as `|v|_inf < 1/2`,
/// and the remaining noise budget is `-log2(2 |v|_inf)`.
///
pub trait NoiseEstimator {

    type NoiseLevel;

    ///
    /// Should return an estimate of `log2(|v|_inf)`.
    ///
    fn estimate_log2_invariant_noise(&self, noise: &Self::NoiseLevel) -> f64;

    fn enc_asym(&self, P: &PlaintextRing, C: &CiphertextRing) -> Self::NoiseLevel;

    fn hom_add(&self, lhs: &Self::NoiseLevel, rhs: &Self::NoiseLevel) -> Self::NoiseLevel;

    fn hom_mul_plain(&self, P: &PlaintextRing, m: &El<PlaintextRing>, ct: &Self::NoiseLevel) -> Self::NoiseLevel;

    fn hom_mul(&self, P: &PlaintextRing, C: &CiphertextRing, lhs: &Self::NoiseLevel, rhs: &Self::NoiseLevel, rk_digits: usize, rk_base_bits: usize) -> Self::NoiseLevel;

    fn clone_noise_level(&self, noise: &Self::NoiseLevel) -> Self::NoiseLevel;

    fn noise_budget(&self, noise: &Self::NoiseLevel) -> usize {
        let budget = -self.estimate_log2_invariant_noise(noise) - 1.;
        if budget <= 0. {
            return 0;
        } else {
            return budget.floor() as usize;
        }
    }
}

fn log2_sum(lhs: f64, rhs: f64) -> f64 {
    let (larger, smaller) = if lhs >= rhs { (lhs, rhs) } else { (rhs, lhs) };
    larger + (1. + (smaller - larger).exp2()).log2()
}

fn log2_q(C: &CiphertextRing) -> f64 {
    BigIntRing::RING.abs_log2_ceil(C.base_ring().modulus()).unwrap() as f64
}

fn log2_t(P: &PlaintextRing) -> f64 {
    (*P.base_ring().modulus() as f64).log2()
}

///
/// A [`NoiseEstimator`] based on worst-case bounds, where Gaussian samples are assumed
/// to be bounded by `6 sigma`. This consistently overestimates the noise, so budgets
/// reported by it are lower than what [`crate::bfv::noise_budget()`] measures.
///
#[derive(Clone, Copy, Debug)]
pub struct NaiveNoiseEstimator {
    noise_std_dev: f64
}

impl NaiveNoiseEstimator {

    pub fn new(noise_std_dev: f64) -> Self {
        assert!(noise_std_dev > 0.);
        Self { noise_std_dev }
    }

    fn log2_error_bound(&self) -> f64 {
        (6. * self.noise_std_dev).log2()
    }
}

impl NoiseEstimator for NaiveNoiseEstimator {

    /// We store `log2(|v|_inf)`
    type NoiseLevel = f64;

    fn estimate_log2_invariant_noise(&self, noise: &Self::NoiseLevel) -> f64 {
        *noise
    }

    fn enc_asym(&self, P: &PlaintextRing, C: &CiphertextRing) -> Self::NoiseLevel {
        // `e u + e0 + e1 s` has infinity norm at most `B (2N + 1)`, and the rounding of `Delta` contributes `t`
        let N = C.rank() as f64;
        let t = *P.base_ring().modulus() as f64;
        let result = log2_t(P) - log2_q(C) + (self.log2_error_bound().exp2() * (2. * N + 1.) + t).log2();
        assert!(!result.is_nan());
        return result;
    }

    fn hom_add(&self, lhs: &Self::NoiseLevel, rhs: &Self::NoiseLevel) -> Self::NoiseLevel {
        let result = log2_sum(*lhs, *rhs);
        assert!(!result.is_nan());
        return result;
    }

    fn hom_mul_plain(&self, P: &PlaintextRing, m: &El<PlaintextRing>, ct: &Self::NoiseLevel) -> Self::NoiseLevel {
        let coefficients = P.wrt_canonical_basis(m);
        let l1_norm = (0..coefficients.len()).map(|i| P.base_ring().smallest_lift(coefficients.at(i)).abs()).sum::<i64>();
        let result = *ct + (l1_norm.max(1) as f64).log2();
        assert!(!result.is_nan());
        return result;
    }

    fn hom_mul(&self, P: &PlaintextRing, C: &CiphertextRing, lhs: &Self::NoiseLevel, rhs: &Self::NoiseLevel, rk_digits: usize, rk_base_bits: usize) -> Self::NoiseLevel {
        let log2_N = (C.rank() as f64).log2();
        // expansion factor `N` of the tensor product, times `|s|_inf + 1` and the rounding error
        let tensor_noise = log2_sum(*lhs, *rhs) + log2_t(P) + log2_N + 3.;
        let relin_noise = log2_t(P) - log2_q(C) + (rk_digits as f64).log2() + log2_N + rk_base_bits as f64 + self.log2_error_bound();
        let result = log2_sum(tensor_noise, relin_noise);
        assert!(!result.is_nan());
        return result;
    }

    fn clone_noise_level(&self, noise: &Self::NoiseLevel) -> Self::NoiseLevel {
        *noise
    }
}

#[cfg(test)]
use crate::bfv::*;
#[cfg(test)]
use feanor_math::homomorphism::Homomorphism;
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;

#[test]
fn test_log2_sum() {
    assert!((log2_sum(3., 3.) - 4.).abs() < 1e-9);
    assert!((log2_sum(-40., 0.) - 0.).abs() < 1e-9);
    assert!((log2_sum(1., 0.) - 3f64.log2()).abs() < 1e-9);
}

#[test]
fn test_naive_estimator_is_conservative() {
    let mut rng = StdRng::seed_from_u64(1);
    let rns_base = sample_rns_primes(256, &[40, 40], &[]).unwrap();
    let C = create_ciphertext_ring(256, &rns_base);
    let C_mul = create_multiplication_ring(&C);
    let P = create_plaintext_ring(256, 257);
    let sk = gen_sk(&C, &mut rng);
    let pk = gen_pk(&C, &mut rng, &sk, 3.2);
    let rk = gen_rk(&C, &mut rng, &sk, 10, 3.2);
    let estimator = NaiveNoiseEstimator::new(3.2);

    let m = P.int_hom().map(7);
    let ct = enc_asym(&P, &C, &mut rng, &m, &pk, 3.2);
    let fresh = estimator.enc_asym(&P, &C);
    assert!(estimator.noise_budget(&fresh) <= noise_budget(&P, &C, &ct, &sk));
    assert!(estimator.noise_budget(&fresh) > 30);

    let ct_sum = hom_add(&C, &ct, &ct);
    let sum = estimator.hom_add(&fresh, &fresh);
    assert_eq!(estimator.noise_budget(&fresh) - 1, estimator.noise_budget(&sum));
    assert!(estimator.noise_budget(&sum) <= noise_budget(&P, &C, &ct_sum, &sk));

    let ct_prod = hom_mul(&P, &C, &C_mul, &ct, &ct, &rk);
    let prod = estimator.hom_mul(&P, &C, &fresh, &fresh, rk.digits(), rk.base_bits());
    assert!(estimator.noise_budget(&prod) <= noise_budget(&P, &C, &ct_prod, &sk));
    assert!(estimator.noise_budget(&prod) + 10 < estimator.noise_budget(&sum));
}

#[test]
fn test_noise_budget_saturates() {
    let estimator = NaiveNoiseEstimator::new(3.2);
    assert_eq!(0, estimator.noise_budget(&0.5));
    assert_eq!(0, estimator.noise_budget(&-1.5));
    assert_eq!(1, estimator.noise_budget(&-2.));
    assert_eq!(27, estimator.noise_budget(&-28.7));
}
