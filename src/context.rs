use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rand::{Rng, CryptoRng, thread_rng};
use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::bfv;
use crate::codec::{PlaintextElement, RationalValue};
use crate::error::Result;
use crate::noise_estimator::NoiseEstimator;
use crate::params::ParameterContext;

///
/// Where a ciphertext is in its life. Only [`CiphertextState::Exhausted`] is relevant
/// for correctness: such a ciphertext may still decrypt correctly, but every homomorphic
/// operation on it is refused.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CiphertextState {
    Fresh,
    /// Contains the number of homomorphic operations that contributed to this ciphertext
    Operated(usize),
    Exhausted
}

///
/// A BFV ciphertext, together with the public bookkeeping of how it was computed.
///
pub struct Ciphertext {
    pub(crate) data: bfv::Ciphertext,
    /// `log2` of the estimated invariant noise
    pub(crate) noise: f64,
    pub(crate) depth: usize,
    pub(crate) operations: usize
}

impl Ciphertext {

    pub(crate) fn noise(&self) -> &f64 {
        &self.noise
    }

    ///
    /// The multiplicative depth, counting both ciphertext and plaintext multiplications.
    ///
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn operation_count(&self) -> usize {
        self.operations
    }

    pub fn state(&self, params: &ParameterContext) -> CiphertextState {
        if params.noise_budget(self) == 0 {
            CiphertextState::Exhausted
        } else if self.operations == 0 {
            CiphertextState::Fresh
        } else {
            CiphertextState::Operated(self.operations)
        }
    }
}

impl Debug for Ciphertext {

    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ciphertext")
            .field("log2_noise", &self.noise)
            .field("depth", &self.depth)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

///
/// Everything that is needed to produce ciphertexts.
///
pub trait EncryptionPort {

    fn parameters(&self) -> &ParameterContext;

    fn encrypt<R: Rng + CryptoRng>(&self, element: &PlaintextElement, rng: R) -> Ciphertext;

    fn encrypt_value<R: Rng + CryptoRng>(&self, value: &RationalValue, rng: R) -> Result<Ciphertext> {
        Ok(self.encrypt(&self.parameters().codec().encode(value)?, rng))
    }

    fn encrypt_f64<R: Rng + CryptoRng>(&self, value: f64, rng: R) -> Result<Ciphertext> {
        Ok(self.encrypt(&self.parameters().codec().encode_f64(value)?, rng))
    }
}

///
/// Everything that is needed to read ciphertexts.
///
pub trait DecryptionPort {

    fn parameters(&self) -> &ParameterContext;

    fn decrypt(&self, ct: &Ciphertext) -> PlaintextElement;

    fn decrypt_value(&self, ct: &Ciphertext) -> Result<RationalValue> {
        self.parameters().codec().decode(&self.decrypt(ct))
    }

    fn decrypt_f64(&self, ct: &Ciphertext) -> Result<f64> {
        Ok(self.decrypt_value(ct)?.to_f64())
    }
}

///
/// Public key material, i.e. everything that is required to encode, encrypt and
/// evaluate, but not to decrypt.
///
pub struct PublicContext {
    params: Arc<ParameterContext>,
    pk: bfv::PublicKey,
    rk: bfv::RelinKey
}

impl PublicContext {

    pub(crate) fn new(params: Arc<ParameterContext>, pk: bfv::PublicKey, rk: bfv::RelinKey) -> Self {
        Self { params, pk, rk }
    }

    pub(crate) fn relin_key(&self) -> &bfv::RelinKey {
        &self.rk
    }

    pub fn params(&self) -> &Arc<ParameterContext> {
        &self.params
    }

    pub fn clone_ciphertext(&self, ct: &Ciphertext) -> Ciphertext {
        Ciphertext {
            data: bfv::clone_ct(self.params.ciphertext_ring(), &ct.data),
            noise: ct.noise,
            depth: ct.depth,
            operations: ct.operations
        }
    }

    ///
    /// Encodes and encrypts the given values, in parallel. Each worker thread uses
    /// its own thread-local randomness.
    ///
    #[instrument(skip_all)]
    pub fn encrypt_values(&self, values: &[RationalValue]) -> Result<Vec<Ciphertext>> {
        let elements = self.params.codec().encode_many(values)?;
        let result = elements.par_iter().map(|m| self.encrypt(m, thread_rng())).collect::<Vec<_>>();
        debug!("encrypted {} values", result.len());
        return Ok(result);
    }
}

impl EncryptionPort for PublicContext {

    fn parameters(&self) -> &ParameterContext {
        &self.params
    }

    #[instrument(skip_all)]
    fn encrypt<R: Rng + CryptoRng>(&self, element: &PlaintextElement, rng: R) -> Ciphertext {
        let P = self.params.plaintext_ring();
        let C = self.params.ciphertext_ring();
        return Ciphertext {
            data: bfv::enc_asym(P, C, rng, element.element(), &self.pk, self.params.params().noise_std_dev),
            noise: self.params.estimator().enc_asym(P, C),
            depth: 0,
            operations: 0
        };
    }
}

///
/// Secret key material. Kept apart from [`PublicContext`], so that code that evaluates
/// on ciphertexts cannot decrypt by accident.
///
pub struct SecretContext {
    params: Arc<ParameterContext>,
    sk: bfv::SecretKey
}

impl SecretContext {

    pub(crate) fn new(params: Arc<ParameterContext>, sk: bfv::SecretKey) -> Self {
        Self { params, sk }
    }

    ///
    /// Computes the actual noise budget of the ciphertext, which requires the secret key.
    ///
    pub fn measured_noise_budget(&self, ct: &Ciphertext) -> usize {
        bfv::noise_budget(self.params.plaintext_ring(), self.params.ciphertext_ring(), &ct.data, &self.sk)
    }
}

impl DecryptionPort for SecretContext {

    fn parameters(&self) -> &ParameterContext {
        &self.params
    }

    fn decrypt(&self, ct: &Ciphertext) -> PlaintextElement {
        PlaintextElement::from_element(bfv::dec(self.params.plaintext_ring(), self.params.ciphertext_ring(), &ct.data, &self.sk))
    }
}

#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;
#[cfg(test)]
use feanor_math::integer::*;
#[cfg(test)]
use feanor_math::ring::*;
#[cfg(test)]
use crate::params::FracParams;

#[cfg(test)]
pub(crate) fn test_contexts(seed: u64) -> (PublicContext, SecretContext) {
    let params = Arc::new(ParameterContext::new(FracParams::default()).unwrap());
    params.generate_keys(StdRng::seed_from_u64(seed))
}

#[test]
fn test_contexts_are_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<PublicContext>();
    assert_send_sync::<SecretContext>();
    assert_send_sync::<Ciphertext>();
}

#[test]
fn test_encrypt_decrypt() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(2);
    let codec = public.params().codec();

    let value = RationalValue::from_ratio(-43, 9, 3, 2).unwrap();
    let element = codec.encode(&value).unwrap();
    let ct = public.encrypt(&element, &mut rng);
    assert!(codec.eq_element(&element, &secret.decrypt(&ct)));
    assert_eq!(value, secret.decrypt_value(&ct).unwrap());

    assert_eq!(CiphertextState::Fresh, ct.state(public.params()));
    assert!(public.params().noise_budget(&ct) <= secret.measured_noise_budget(&ct));

    let ct = public.encrypt_f64(-0.75, &mut rng).unwrap();
    assert!((secret.decrypt_f64(&ct).unwrap() + 0.75).abs() < 1e-12);
}

#[test]
fn test_encrypt_is_randomized() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(3);
    let C = public.params().ciphertext_ring();
    let value = RationalValue::from_integer(5, 3);
    let ct1 = public.encrypt_value(&value, &mut rng).unwrap();
    let ct2 = public.encrypt_value(&value, &mut rng).unwrap();
    assert!(!C.eq_el(&ct1.data.1, &ct2.data.1));
    assert_eq!(secret.decrypt_value(&ct1).unwrap(), secret.decrypt_value(&ct2).unwrap());
}

#[test]
fn test_encrypt_values_parallel() {
    let (public, secret) = test_contexts(1);
    let values = (-4..4).map(|i| RationalValue::from_ratio(i, 4, 3, 32).unwrap()).collect::<Vec<_>>();
    let cts = public.encrypt_values(&values).unwrap();
    assert_eq!(values.len(), cts.len());
    for (value, ct) in values.iter().zip(cts.iter()) {
        assert_eq!(*value, secret.decrypt_value(ct).unwrap());
    }

    let too_large = vec![RationalValue::new(BigIntRing::RING.power_of_two(200), 3, 0)];
    assert!(public.encrypt_values(&too_large).is_err());
}
