use feanor_math::algorithms::miller_rabin::is_prime;
use feanor_math::homomorphism::*;
use feanor_math::integer::*;
use feanor_math::pid::EuclideanRingStore;
use feanor_math::primitive_int::StaticRing;
use feanor_math::ring::*;
use feanor_math::rings::extension::FreeAlgebraStore;
use feanor_math::rings::extension::extension_impl::FreeAlgebraImpl;
use feanor_math::rings::finite::FiniteRingStore;
use feanor_math::rings::zn::*;
use feanor_math::seq::*;

use rand::{Rng, RngCore, CryptoRng};
use rand_distr::StandardNormal;
use tracing::instrument;

#[cfg(test)]
use feanor_math::assert_el_eq;
#[cfg(test)]
use rand::thread_rng;

pub type PlaintextZn = zn_64::Zn;
pub type PlaintextRing = FreeAlgebraImpl<PlaintextZn, Vec<El<PlaintextZn>>>;
pub type CiphertextZn = zn_rns::Zn<zn_64::Zn, BigIntRing>;
pub type CiphertextRing = FreeAlgebraImpl<CiphertextZn, Vec<El<CiphertextZn>>>;

pub type SecretKey = El<CiphertextRing>;
pub type PublicKey = (El<CiphertextRing>, El<CiphertextRing>);
pub type Ciphertext = (El<CiphertextRing>, El<CiphertextRing>);
pub type ThreeComponentCiphertext = (El<CiphertextRing>, El<CiphertextRing>, El<CiphertextRing>);

const ZZbig: BigIntRing = BigIntRing::RING;
const ZZ: StaticRing<i64> = StaticRing::<i64>::RING;

///
/// Size of the primes used for the RNS base of the multiplication ring; primes
/// of the ciphertext modulus chain never exceed this either.
///
pub const MAX_RNS_FACTOR_BITS: usize = 50;

///
/// Relinearization key, i.e. encryptions of `B^i s^2` for the gadget vector
/// `(1, B, B^2, ...)` with `B = 2^base_bits`.
///
pub struct RelinKey {
    base_bits: usize,
    components: Vec<(El<CiphertextRing>, El<CiphertextRing>)>
}

impl RelinKey {

    pub fn base_bits(&self) -> usize {
        self.base_bits
    }

    pub fn digits(&self) -> usize {
        self.components.len()
    }
}

///
/// Returns the largest prime `p < bound` with `p = 1 mod n`.
///
pub fn largest_prime_congruent_one_below(n: i64, bound: i64) -> Option<i64> {
    let mut candidate = (bound - 2) - ((bound - 2) % n) + 1;

    while candidate > 1 {
        if is_prime(ZZ, &candidate, 10) {
            return Some(candidate);
        }
        candidate -= n;
    }
    return None;
}

///
/// Samples distinct primes `p = 1 mod 2N` such that the `i`-th prime has exactly
/// `bit_sizes[i]` bits. Primes contained in `exclude` are skipped.
///
pub fn sample_rns_primes(ring_degree: usize, bit_sizes: &[usize], exclude: &[i64]) -> Option<Vec<i64>> {
    let n = 2 * ring_degree as i64;
    let mut result: Vec<i64> = Vec::with_capacity(bit_sizes.len());
    for bits in bit_sizes {
        assert!(*bits >= 2 && *bits <= MAX_RNS_FACTOR_BITS);
        let lower_bound = 1i64 << (bits - 1);
        let mut bound = 1i64 << bits;
        let p = loop {
            let candidate = largest_prime_congruent_one_below(n, bound)?;
            if candidate < lower_bound {
                return None;
            }
            if !result.contains(&candidate) && !exclude.contains(&candidate) {
                break candidate;
            }
            bound = candidate;
        };
        result.push(p);
    }
    return Some(result);
}

pub fn create_plaintext_ring(ring_degree: usize, plaintext_modulus: u64) -> PlaintextRing {
    let Zt = zn_64::Zn::new(plaintext_modulus);
    // we give the modulus as the coefficients of `X^N mod (X^N + 1)`
    let x_pow_rank = vec![Zt.neg_one()];
    return FreeAlgebraImpl::new(Zt, ring_degree, x_pow_rank);
}

pub fn create_ciphertext_ring(ring_degree: usize, rns_base: &[i64]) -> CiphertextRing {
    let Zq = zn_rns::Zn::new(rns_base.iter().map(|p| zn_64::Zn::new(*p as u64)).collect(), ZZbig);
    let x_pow_rank = vec![Zq.neg_one()];
    return FreeAlgebraImpl::new(Zq, ring_degree, x_pow_rank);
}

///
/// Creates the ring `R_q'` in which the tensor product of two ciphertexts is computed
/// exactly, i.e. `q' > N q^2` so that no wrap-around happens before scaling down by `t/q`.
///
pub fn create_multiplication_ring(C: &CiphertextRing) -> CiphertextRing {
    let log2_q = ZZbig.abs_log2_ceil(C.base_ring().modulus()).unwrap();
    let log2_N = ZZ.abs_log2_ceil(&(C.rank() as i64)).unwrap();
    let required_bits = 2 * log2_q + log2_N + 2;
    let factor_count = (required_bits - 1) / (MAX_RNS_FACTOR_BITS - 1) + 1;
    let existing = C.base_ring().as_iter().map(|Zp| *Zp.modulus()).collect::<Vec<_>>();
    let rns_base = sample_rns_primes(C.rank(), &vec![MAX_RNS_FACTOR_BITS; factor_count], &existing).unwrap();
    return create_ciphertext_ring(C.rank(), &rns_base);
}

fn sample_ternary<R: Rng + CryptoRng>(C: &CiphertextRing, rng: &mut R) -> El<CiphertextRing> {
    C.from_canonical_basis((0..C.rank()).map(|_| C.base_ring().int_hom().map((rng.next_u32() % 3) as i32 - 1)))
}

fn sample_error<R: Rng + CryptoRng>(C: &CiphertextRing, rng: &mut R, noise_std_dev: f64) -> El<CiphertextRing> {
    C.from_canonical_basis((0..C.rank()).map(|_| C.base_ring().int_hom().map(
        (rng.sample::<f64, _>(StandardNormal) * noise_std_dev).round() as i32
    )))
}

fn sample_uniform<R: Rng + CryptoRng>(C: &CiphertextRing, rng: &mut R) -> El<CiphertextRing> {
    C.from_canonical_basis((0..C.rank()).map(|_| C.base_ring().random_element(|| rng.next_u64())))
}

///
/// The scaling factor `Delta = round(q / t)`.
///
pub fn delta(P: &PlaintextRing, C: &CiphertextRing) -> El<BigIntRing> {
    ZZbig.rounded_div(
        ZZbig.clone_el(C.base_ring().modulus()),
        &int_cast(*P.base_ring().modulus(), ZZbig, ZZ)
    )
}

fn lift_plaintext(P: &PlaintextRing, C: &CiphertextRing, m: &El<PlaintextRing>) -> El<CiphertextRing> {
    let coefficients = P.wrt_canonical_basis(m);
    C.from_canonical_basis((0..coefficients.len()).map(|i| C.base_ring().int_hom().map(
        P.base_ring().smallest_lift(coefficients.at(i)) as i32
    )))
}

pub fn gen_sk<R: Rng + CryptoRng>(C: &CiphertextRing, mut rng: R) -> SecretKey {
    // we sample uniform ternary secrets
    sample_ternary(C, &mut rng)
}

pub fn enc_sym_zero<R: Rng + CryptoRng>(C: &CiphertextRing, mut rng: R, sk: &SecretKey, noise_std_dev: f64) -> Ciphertext {
    let a = sample_uniform(C, &mut rng);
    let mut b = C.negate(C.mul_ref(&a, sk));
    let e = sample_error(C, &mut rng, noise_std_dev);
    C.add_assign(&mut b, e);
    return (b, a);
}

///
/// The public key is just a symmetric encryption of zero, i.e. `(-a s + e, a)`.
///
pub fn gen_pk<R: Rng + CryptoRng>(C: &CiphertextRing, rng: R, sk: &SecretKey, noise_std_dev: f64) -> PublicKey {
    enc_sym_zero(C, rng, sk, noise_std_dev)
}

#[instrument(skip_all)]
pub fn gen_rk<R: Rng + CryptoRng>(C: &CiphertextRing, mut rng: R, sk: &SecretKey, base_bits: usize, noise_std_dev: f64) -> RelinKey {
    let sk_sqr = C.pow(C.clone_el(sk), 2);
    let digits = gadget_digit_count(C, base_bits);
    let modulo_q = C.base_ring().can_hom(&ZZbig).unwrap();
    let components = (0..digits).map(|i| {
        let (b, a) = enc_sym_zero(C, &mut rng, sk, noise_std_dev);
        let factor = modulo_q.map(ZZbig.power_of_two(i * base_bits));
        (C.add(b, C.inclusion().mul_ref_map(&sk_sqr, &factor)), a)
    }).collect();
    return RelinKey { base_bits, components };
}

///
/// Public-key encryption `(p0 u + e0 + Delta m, p1 u + e1)` with ternary `u`.
///
pub fn enc_asym<R: Rng + CryptoRng>(P: &PlaintextRing, C: &CiphertextRing, mut rng: R, m: &El<PlaintextRing>, pk: &PublicKey, noise_std_dev: f64) -> Ciphertext {
    let (p0, p1) = pk;
    let u = sample_ternary(C, &mut rng);
    let e0 = sample_error(C, &mut rng, noise_std_dev);
    let e1 = sample_error(C, &mut rng, noise_std_dev);
    let c0 = C.add(C.mul_ref(p0, &u), e0);
    let c1 = C.add(C.mul_ref(p1, &u), e1);
    return hom_add_plain(P, C, m, (c0, c1));
}

pub fn remove_noise(P: &PlaintextRing, C: &CiphertextRing, c: &El<CiphertextRing>) -> El<PlaintextRing> {
    let coefficients = C.wrt_canonical_basis(c);
    let t = int_cast(*P.base_ring().modulus(), ZZbig, ZZ);
    let modulo_t = P.base_ring().can_hom(&ZZbig).unwrap();
    // scaling by `t/q`, including the final rounding
    return P.from_canonical_basis((0..coefficients.len()).map(|i| modulo_t.map(ZZbig.rounded_div(
        ZZbig.mul_ref_fst(&t, C.base_ring().smallest_lift(coefficients.at(i))),
        C.base_ring().modulus()
    ))));
}

pub fn dec(P: &PlaintextRing, C: &CiphertextRing, ct: &Ciphertext, sk: &SecretKey) -> El<PlaintextRing> {
    let noisy_m = C.add_ref_fst(&ct.0, C.mul_ref(&ct.1, sk));
    return remove_noise(P, C, &noisy_m);
}

///
/// Computes the remaining noise budget `log2(q) - log2(|e|) - log2(t) - 1` exactly,
/// where `c0 + c1 s = Delta m + e`. This requires the secret key.
///
pub fn noise_budget(P: &PlaintextRing, C: &CiphertextRing, ct: &Ciphertext, sk: &SecretKey) -> usize {
    let noisy_m = C.add_ref_fst(&ct.0, C.mul_ref(&ct.1, sk));
    let coefficients = C.wrt_canonical_basis(&noisy_m);
    let Delta = delta(P, C);
    let log2_noise = (0..coefficients.len()).map(|i| {
        let c = C.base_ring().smallest_lift(coefficients.at(i));
        let size = ZZbig.abs_log2_ceil(&ZZbig.sub_ref_fst(&c, ZZbig.mul_ref_snd(ZZbig.rounded_div(ZZbig.clone_el(&c), &Delta), &Delta)));
        return size.unwrap_or(0);
    }).max().unwrap_or(0);
    let log2_t = ZZ.abs_log2_ceil(P.base_ring().modulus()).unwrap();
    return ZZbig.abs_log2_ceil(C.base_ring().modulus()).unwrap().saturating_sub(log2_noise + log2_t + 1);
}

pub fn clone_ct(C: &CiphertextRing, ct: &Ciphertext) -> Ciphertext {
    (C.clone_el(&ct.0), C.clone_el(&ct.1))
}

pub fn hom_add(C: &CiphertextRing, lhs: &Ciphertext, rhs: &Ciphertext) -> Ciphertext {
    (C.add_ref(&lhs.0, &rhs.0), C.add_ref(&lhs.1, &rhs.1))
}

///
/// Same as [`hom_add()`], but reuses the storage of `lhs`.
///
pub fn hom_add_assign(C: &CiphertextRing, lhs: Ciphertext, rhs: &Ciphertext) -> Ciphertext {
    let (mut lhs0, mut lhs1) = lhs;
    C.add_assign_ref(&mut lhs0, &rhs.0);
    C.add_assign_ref(&mut lhs1, &rhs.1);
    return (lhs0, lhs1);
}

pub fn hom_add_plain(P: &PlaintextRing, C: &CiphertextRing, m: &El<PlaintextRing>, ct: Ciphertext) -> Ciphertext {
    let mut m = lift_plaintext(P, C, m);
    let Delta = C.base_ring().coerce(&ZZbig, delta(P, C));
    C.inclusion().mul_assign_ref_map(&mut m, &Delta);
    return (C.add(ct.0, m), ct.1);
}

pub fn hom_mul_plain(P: &PlaintextRing, C: &CiphertextRing, m: &El<PlaintextRing>, ct: &Ciphertext) -> Ciphertext {
    let m = lift_plaintext(P, C, m);
    return (C.mul_ref(&ct.0, &m), C.mul_ref(&ct.1, &m));
}

fn lift_to_multiplication_ring(C: &CiphertextRing, C_mul: &CiphertextRing, c: &El<CiphertextRing>) -> El<CiphertextRing> {
    let coefficients = C.wrt_canonical_basis(c);
    let hom = C_mul.base_ring().can_hom(&ZZbig).unwrap();
    C_mul.from_canonical_basis((0..coefficients.len()).map(|i| hom.map(C.base_ring().smallest_lift(coefficients.at(i)))))
}

fn scale_down_from_multiplication_ring(P: &PlaintextRing, C: &CiphertextRing, C_mul: &CiphertextRing, c: &El<CiphertextRing>) -> El<CiphertextRing> {
    let coefficients = C_mul.wrt_canonical_basis(c);
    let t = int_cast(*P.base_ring().modulus(), ZZbig, ZZ);
    let modulo_q = C.base_ring().can_hom(&ZZbig).unwrap();
    C.from_canonical_basis((0..coefficients.len()).map(|i| modulo_q.map(ZZbig.rounded_div(
        ZZbig.mul_ref_snd(C_mul.base_ring().smallest_lift(coefficients.at(i)), &t),
        C.base_ring().modulus()
    ))))
}

///
/// Computes `round(t/q * (c0, c1) (x) (c0', c1'))`, i.e. a ciphertext w.r.t. `(1, s, s^2)`.
///
pub fn hom_mul_three_component(P: &PlaintextRing, C: &CiphertextRing, C_mul: &CiphertextRing, lhs: &Ciphertext, rhs: &Ciphertext) -> ThreeComponentCiphertext {
    let (c00, c01) = (lift_to_multiplication_ring(C, C_mul, &lhs.0), lift_to_multiplication_ring(C, C_mul, &lhs.1));
    let (c10, c11) = (lift_to_multiplication_ring(C, C_mul, &rhs.0), lift_to_multiplication_ring(C, C_mul, &rhs.1));

    let product = (
        C_mul.mul_ref(&c00, &c10),
        C_mul.add(C_mul.mul_ref(&c00, &c11), C_mul.mul_ref(&c01, &c10)),
        C_mul.mul(c01, c11)
    );

    return (
        scale_down_from_multiplication_ring(P, C, C_mul, &product.0),
        scale_down_from_multiplication_ring(P, C, C_mul, &product.1),
        scale_down_from_multiplication_ring(P, C, C_mul, &product.2)
    );
}

pub fn gadget_digit_count(C: &CiphertextRing, base_bits: usize) -> usize {
    let log2_q = ZZbig.abs_log2_ceil(C.base_ring().modulus()).unwrap();
    (log2_q - 1) / base_bits + 1
}

fn gadget_decompose(C: &CiphertextRing, c: &El<CiphertextRing>, base_bits: usize, digits: usize) -> Vec<El<CiphertextRing>> {
    let B = ZZbig.power_of_two(base_bits);
    let modulo_q = C.base_ring().can_hom(&ZZbig).unwrap();
    let coefficients = C.wrt_canonical_basis(c);
    let mut decomposition = (0..digits).map(|_| Vec::with_capacity(coefficients.len())).collect::<Vec<_>>();
    for i in 0..coefficients.len() {
        let mut x = C.base_ring().smallest_positive_lift(coefficients.at(i));
        for j in 0..digits {
            let (quotient, remainder) = ZZbig.euclidean_div_rem(x, &B);
            x = quotient;
            decomposition[j].push(modulo_q.map(remainder));
        }
        debug_assert!(ZZbig.is_zero(&x));
    }
    return decomposition.into_iter().map(|coefficients| C.from_canonical_basis(coefficients.into_iter())).collect();
}

pub fn relinearize(C: &CiphertextRing, ct: ThreeComponentCiphertext, rk: &RelinKey) -> Ciphertext {
    let (c0, c1, c2) = ct;
    let c2_decomposition = gadget_decompose(C, &c2, rk.base_bits, rk.components.len());
    return (
        C.add(c0, C.sum(c2_decomposition.iter().zip(rk.components.iter()).map(|(c, (rk0, _))| C.mul_ref(c, rk0)))),
        C.add(c1, C.sum(c2_decomposition.iter().zip(rk.components.iter()).map(|(c, (_, rk1))| C.mul_ref(c, rk1))))
    );
}

#[instrument(skip_all)]
pub fn hom_mul(P: &PlaintextRing, C: &CiphertextRing, C_mul: &CiphertextRing, lhs: &Ciphertext, rhs: &Ciphertext, rk: &RelinKey) -> Ciphertext {
    relinearize(C, hom_mul_three_component(P, C, C_mul, lhs, rhs), rk)
}

#[cfg(test)]
fn test_rings(ring_degree: usize, t: u64) -> (PlaintextRing, CiphertextRing, CiphertextRing) {
    let rns_base = sample_rns_primes(ring_degree, &[40, 40], &[]).unwrap();
    let C = create_ciphertext_ring(ring_degree, &rns_base);
    let C_mul = create_multiplication_ring(&C);
    return (create_plaintext_ring(ring_degree, t), C, C_mul);
}

#[test]
fn test_sample_rns_primes() {
    let primes = sample_rns_primes(2048, &[27, 27, 30], &[]).unwrap();
    assert_eq!(3, primes.len());
    assert!(primes[0] != primes[1]);
    for (p, bits) in primes.iter().zip([27, 27, 30]) {
        assert_eq!(1, p % 4096);
        assert_eq!(bits, ZZ.abs_log2_ceil(p).unwrap());
        assert!(is_prime(ZZ, p, 10));
    }
    let more = sample_rns_primes(2048, &[27], &primes).unwrap();
    assert!(!primes.contains(&more[0]));
}

#[test]
fn test_bfv_enc_dec() {
    let mut rng = thread_rng();
    let (P, C, _C_mul) = test_rings(256, 257);
    let sk = gen_sk(&C, &mut rng);
    let pk = gen_pk(&C, &mut rng, &sk, 3.2);

    let m = P.from_canonical_basis((0..256).map(|i| P.base_ring().int_hom().map(i as i32 - 128)));
    let ct = enc_asym(&P, &C, &mut rng, &m, &pk, 3.2);
    assert_el_eq!(&P, &m, &dec(&P, &C, &ct, &sk));
    assert!(noise_budget(&P, &C, &ct, &sk) > 30);
}

#[test]
fn test_bfv_hom_add_and_mul_plain() {
    let mut rng = thread_rng();
    let (P, C, _C_mul) = test_rings(256, 257);
    let sk = gen_sk(&C, &mut rng);
    let pk = gen_pk(&C, &mut rng, &sk, 3.2);

    let m = P.int_hom().map(5);
    let ct = enc_asym(&P, &C, &mut rng, &m, &pk, 3.2);

    let sum = hom_add(&C, &ct, &ct);
    assert_el_eq!(&P, &P.int_hom().map(10), &dec(&P, &C, &sum, &sk));

    let sum = hom_add_assign(&C, sum, &ct);
    assert_el_eq!(&P, &P.int_hom().map(15), &dec(&P, &C, &sum, &sk));

    let factor = P.add(P.canonical_gen(), P.int_hom().map(2));
    let prod = hom_mul_plain(&P, &C, &factor, &ct);
    assert_el_eq!(&P, &P.mul(factor, P.int_hom().map(5)), &dec(&P, &C, &prod, &sk));
    // the input is untouched
    assert_el_eq!(&P, &m, &dec(&P, &C, &ct, &sk));
}

#[test]
fn test_bfv_hom_mul() {
    let mut rng = thread_rng();
    let (P, C, C_mul) = test_rings(256, 257);
    let sk = gen_sk(&C, &mut rng);
    let pk = gen_pk(&C, &mut rng, &sk, 3.2);
    let rk = gen_rk(&C, &mut rng, &sk, 10, 3.2);
    assert_eq!(8, rk.digits());

    let m = P.add(P.canonical_gen(), P.int_hom().map(2));
    let ct = enc_asym(&P, &C, &mut rng, &m, &pk, 3.2);
    let fresh_budget = noise_budget(&P, &C, &ct, &sk);

    let ct_sqr = hom_mul(&P, &C, &C_mul, &ct, &ct, &rk);
    assert_el_eq!(&P, &P.pow(m, 2), &dec(&P, &C, &ct_sqr, &sk));
    assert!(noise_budget(&P, &C, &ct_sqr, &sk) < fresh_budget);
}

#[test]
fn test_bfv_noise_budget_add_vs_mul() {
    let mut rng = thread_rng();
    let (P, C, C_mul) = test_rings(256, 257);
    let sk = gen_sk(&C, &mut rng);
    let pk = gen_pk(&C, &mut rng, &sk, 3.2);
    let rk = gen_rk(&C, &mut rng, &sk, 10, 3.2);

    let ct = enc_asym(&P, &C, &mut rng, &P.int_hom().map(3), &pk, 3.2);
    let fresh_budget = noise_budget(&P, &C, &ct, &sk);
    let after_add = noise_budget(&P, &C, &hom_add(&C, &ct, &ct), &sk);
    let after_mul = noise_budget(&P, &C, &hom_mul(&P, &C, &C_mul, &ct, &ct, &rk), &sk);
    assert!(fresh_budget - after_add <= 1);
    assert!(fresh_budget - after_mul > fresh_budget - after_add);
}
