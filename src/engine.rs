use tracing::{debug, info, warn, instrument};

use crate::bfv;
use crate::codec::PlaintextElement;
use crate::context::{Ciphertext, PublicContext};
use crate::error::{FracError, Result};
use crate::noise_estimator::NoiseEstimator;
use crate::params::ParameterContext;

///
/// How [`HomomorphicArithmeticEngine::sum_many()`] groups the additions. The result is
/// the same in both cases, only the bookkeeping (i.e. operation count and depth
/// of intermediate values) differs.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SumStrategy {
    Sequential,
    #[default]
    BalancedTree
}

///
/// Arithmetic on encrypted values. All operations take their inputs by reference and
/// return a new ciphertext, with the exception of [`HomomorphicArithmeticEngine::add_owned()`].
///
/// Before doing any work, every operation checks the estimated noise budget of its
/// operands and of its result, and fails with [`FracError::NoiseBudgetExhausted`] if the
/// result would have no noise budget left.
///
pub struct HomomorphicArithmeticEngine<'a> {
    context: &'a PublicContext,
    sum_strategy: SumStrategy
}

impl<'a> HomomorphicArithmeticEngine<'a> {

    pub fn new(context: &'a PublicContext) -> Self {
        Self { context, sum_strategy: SumStrategy::default() }
    }

    pub fn with_sum_strategy(self, sum_strategy: SumStrategy) -> Self {
        Self { context: self.context, sum_strategy }
    }

    pub fn params(&self) -> &ParameterContext {
        self.context.params()
    }

    pub fn noise_budget(&self, ct: &Ciphertext) -> usize {
        self.params().noise_budget(ct)
    }

    fn check_not_exhausted(&self, ct: &Ciphertext) -> Result<()> {
        if self.noise_budget(ct) == 0 {
            return Err(FracError::NoiseBudgetExhausted { available: 0, required: 1 });
        }
        return Ok(());
    }

    ///
    /// Fails if a result with the given estimated noise would have no noise budget left.
    /// The reported requirement is the number of bits the operation consumes on its noisiest
    /// operand, plus one bit that must remain.
    ///
    fn check_result_budget(&self, operands: &[&Ciphertext], noise: f64, operation: &str) -> Result<()> {
        if self.params().estimator().noise_budget(&noise) > 0 {
            return Ok(());
        }
        let noisiest = operands.iter().map(|ct| ct.noise).fold(f64::NEG_INFINITY, f64::max);
        let available = self.params().estimator().noise_budget(&noisiest);
        warn!("refusing {} on ciphertext with {} bits of noise budget", operation, available);
        return Err(FracError::NoiseBudgetExhausted { available, required: (noise - noisiest).ceil() as usize + 1 });
    }

    pub fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> Result<Ciphertext> {
        self.check_not_exhausted(lhs)?;
        self.check_not_exhausted(rhs)?;
        let noise = self.params().estimator().hom_add(&lhs.noise, &rhs.noise);
        self.check_result_budget(&[lhs, rhs], noise, "addition")?;
        return Ok(Ciphertext {
            data: bfv::hom_add(self.params().ciphertext_ring(), &lhs.data, &rhs.data),
            noise,
            depth: usize::max(lhs.depth, rhs.depth),
            operations: lhs.operations + rhs.operations + 1
        });
    }

    ///
    /// Same as [`HomomorphicArithmeticEngine::add()`], but reuses `lhs` as accumulator.
    ///
    pub fn add_owned(&self, lhs: Ciphertext, rhs: &Ciphertext) -> Result<Ciphertext> {
        self.check_not_exhausted(&lhs)?;
        self.check_not_exhausted(rhs)?;
        let noise = self.params().estimator().hom_add(&lhs.noise, &rhs.noise);
        self.check_result_budget(&[&lhs, rhs], noise, "addition")?;
        return Ok(Ciphertext {
            data: bfv::hom_add_assign(self.params().ciphertext_ring(), lhs.data, &rhs.data),
            noise,
            depth: usize::max(lhs.depth, rhs.depth),
            operations: lhs.operations + rhs.operations + 1
        });
    }

    ///
    /// Multiplies by a public value. The noise grows by the factor `|m|_1`, so this is much
    /// cheaper than [`HomomorphicArithmeticEngine::multiply()`].
    ///
    pub fn multiply_plain(&self, ct: &Ciphertext, m: &PlaintextElement) -> Result<Ciphertext> {
        self.check_not_exhausted(ct)?;
        let P = self.params().plaintext_ring();
        let estimator = self.params().estimator();
        let noise = estimator.hom_mul_plain(P, m.element(), &ct.noise);
        self.check_result_budget(&[ct], noise, "plaintext multiplication")?;
        return Ok(Ciphertext {
            data: bfv::hom_mul_plain(P, self.params().ciphertext_ring(), m.element(), &ct.data),
            noise,
            depth: ct.depth + 1,
            operations: ct.operations + 1
        });
    }

    ///
    /// Computes `lhs - rhs` as `lhs + (-1) * rhs`. Both operands stay unchanged.
    ///
    pub fn subtract(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> Result<Ciphertext> {
        let minus_one = self.params().codec().encode_integer(-1)?;
        let negated = self.multiply_plain(rhs, &minus_one)?;
        return self.add_owned(negated, lhs);
    }

    ///
    /// Multiplies two ciphertexts, including relinearization. Both operands must have at least
    /// [`ParameterContext::multiplication_noise_threshold()`] bits of noise budget.
    ///
    #[instrument(skip_all)]
    pub fn multiply(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> Result<Ciphertext> {
        let required = self.params().multiplication_noise_threshold();
        for ct in [lhs, rhs] {
            let available = self.noise_budget(ct);
            if available < required {
                warn!("refusing multiplication of ciphertext with {} bits of noise budget, {} are required", available, required);
                return Err(FracError::NoiseBudgetExhausted { available, required });
            }
        }
        let params = self.params();
        let rk = self.context.relin_key();
        let result = Ciphertext {
            data: bfv::hom_mul(params.plaintext_ring(), params.ciphertext_ring(), params.multiplication_ring(), &lhs.data, &rhs.data, rk),
            noise: params.estimator().hom_mul(params.plaintext_ring(), params.ciphertext_ring(), &lhs.noise, &rhs.noise, rk.digits(), rk.base_bits()),
            depth: usize::max(lhs.depth, rhs.depth) + 1,
            operations: lhs.operations + rhs.operations + 1
        };
        debug!("noise budget after multiplication is {} bits", self.noise_budget(&result));
        return Ok(result);
    }

    fn sum_balanced(&self, cts: &[Ciphertext]) -> Result<Ciphertext> {
        if cts.len() == 1 {
            return Ok(self.context.clone_ciphertext(&cts[0]));
        }
        let (left, right) = cts.split_at(cts.len() / 2);
        let left = self.sum_balanced(left)?;
        let right = self.sum_balanced(right)?;
        return self.add_owned(left, &right);
    }

    ///
    /// Computes the sum of all given ciphertexts, grouped according to the [`SumStrategy`]
    /// of this engine.
    ///
    pub fn sum_many(&self, cts: &[Ciphertext]) -> Result<Ciphertext> {
        let Some((first, rest)) = cts.split_first() else {
            return Err(FracError::InvalidArgument(format!("sum of no ciphertexts")));
        };
        match self.sum_strategy {
            SumStrategy::Sequential => {
                self.check_not_exhausted(first)?;
                rest.iter().try_fold(self.context.clone_ciphertext(first), |current, ct| self.add_owned(current, ct))
            },
            SumStrategy::BalancedTree => {
                for ct in cts {
                    self.check_not_exhausted(ct)?;
                }
                self.sum_balanced(cts)
            }
        }
    }

    ///
    /// Computes `divisor * sum_i weights[i] * values[i]`. This consumes two levels of plaintext
    /// multiplication. If the result would have no noise budget left, this fails before any
    /// homomorphic operation is performed.
    ///
    #[instrument(skip_all)]
    pub fn weighted_average(&self, values: &[Ciphertext], weights: &[PlaintextElement], divisor: &PlaintextElement) -> Result<Ciphertext> {
        let predicted = self.params().predict_weighted_average_noise(values, weights, divisor, self.sum_strategy)?;
        self.check_result_budget(&values.iter().collect::<Vec<_>>(), predicted, "weighted average")?;
        let products = values.iter().zip(weights.iter())
            .map(|(ct, w)| self.multiply_plain(ct, w))
            .collect::<Result<Vec<_>>>()?;
        let result = self.multiply_plain(&self.sum_many(&products)?, divisor)?;
        info!("weighted average of {} values has {} bits of noise budget left", values.len(), self.noise_budget(&result));
        return Ok(result);
    }
}

#[cfg(test)]
use crate::codec::RationalValue;
#[cfg(test)]
use crate::context::{test_contexts, CiphertextState, DecryptionPort, EncryptionPort};
#[cfg(test)]
use rand::rngs::StdRng;
#[cfg(test)]
use rand::SeedableRng;

#[test]
fn test_add_fractions() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(1);
    let engine = HomomorphicArithmeticEngine::new(&public);

    let a = public.encrypt_f64(3.5, &mut rng).unwrap();
    let b = public.encrypt_f64(-1.25, &mut rng).unwrap();
    let sum = engine.add(&a, &b).unwrap();
    let result = secret.decrypt_value(&sum).unwrap();
    assert!((result.to_f64() - 2.25).abs() <= 3f64.powi(-32) * 1.01);

    // the rounding errors of encoding add up, but nothing else is lost
    let expected = RationalValue::from_f64(3.5, 3, 32).unwrap().add(&RationalValue::from_f64(-1.25, 3, 32).unwrap());
    assert_eq!(expected, result);
    assert_eq!(CiphertextState::Operated(1), sum.state(public.params()));
    assert_eq!(0, sum.depth());
}

#[test]
fn test_add_is_commutative_and_associative() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(2);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let values = [RationalValue::from_ratio(10, 9, 3, 2).unwrap(), RationalValue::from_integer(-7, 3), RationalValue::from_ratio(1, 27, 3, 3).unwrap()];
    let cts = values.iter().map(|x| public.encrypt_value(x, &mut rng).unwrap()).collect::<Vec<_>>();

    let lhs = engine.add(&engine.add(&cts[0], &cts[1]).unwrap(), &cts[2]).unwrap();
    let rhs = engine.add(&cts[2], &engine.add(&cts[1], &cts[0]).unwrap()).unwrap();
    let expected = values[0].add(&values[1]).add(&values[2]);
    assert_eq!(expected, secret.decrypt_value(&lhs).unwrap());
    assert_eq!(expected, secret.decrypt_value(&rhs).unwrap());
}

#[test]
fn test_subtract_keeps_operands() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(3);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let a = RationalValue::from_integer(5, 3);
    let b = RationalValue::from_ratio(7, 3, 3, 1).unwrap();
    let a_ct = public.encrypt_value(&a, &mut rng).unwrap();
    let b_ct = public.encrypt_value(&b, &mut rng).unwrap();

    let difference = engine.subtract(&a_ct, &b_ct).unwrap();
    assert_eq!(a.sub(&b), secret.decrypt_value(&difference).unwrap());
    assert_eq!(b, secret.decrypt_value(&b_ct).unwrap());
    assert_eq!(a, secret.decrypt_value(&a_ct).unwrap());

    // `b` can still be used
    let sum = engine.add(&difference, &b_ct).unwrap();
    assert_eq!(a, secret.decrypt_value(&sum).unwrap());
}

#[test]
fn test_multiply() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(4);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let a = RationalValue::from_ratio(7, 3, 3, 1).unwrap();
    let b = RationalValue::from_integer(-4, 3);
    let a_ct = public.encrypt_value(&a, &mut rng).unwrap();
    let b_ct = public.encrypt_value(&b, &mut rng).unwrap();

    let product = engine.multiply(&a_ct, &b_ct).unwrap();
    assert_eq!(a.mul(&b), secret.decrypt_value(&product).unwrap());
    assert_eq!(1, product.depth());
    assert!(engine.noise_budget(&product) <= secret.measured_noise_budget(&product));

    let plain_product = engine.multiply_plain(&a_ct, &public.params().codec().encode(&b).unwrap()).unwrap();
    assert_eq!(a.mul(&b), secret.decrypt_value(&plain_product).unwrap());
    assert!(engine.noise_budget(&plain_product) > engine.noise_budget(&product));
}

#[test]
fn test_multiply_consumes_more_than_add() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(5);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let a = public.encrypt_f64(1.5, &mut rng).unwrap();
    let b = public.encrypt_f64(2., &mut rng).unwrap();
    let fresh_budget = usize::min(engine.noise_budget(&a), engine.noise_budget(&b));

    let sum = engine.add(&a, &b).unwrap();
    let product = engine.multiply(&a, &b).unwrap();
    assert!(fresh_budget - engine.noise_budget(&sum) <= 1);
    assert!(fresh_budget - engine.noise_budget(&product) > fresh_budget - engine.noise_budget(&sum));

    assert!(secret.measured_noise_budget(&product) < secret.measured_noise_budget(&sum));
}

#[test]
fn test_multiply_exhausted() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(6);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let a = public.encrypt_value(&RationalValue::from_integer(3, 3), &mut rng).unwrap();
    let b = public.encrypt_value(&RationalValue::from_integer(2, 3), &mut rng).unwrap();

    let product = engine.multiply(&a, &b).unwrap();
    assert_eq!(RationalValue::from_integer(6, 3), secret.decrypt_value(&product).unwrap());
    let threshold = public.params().multiplication_noise_threshold();
    assert!(engine.noise_budget(&product) < threshold);

    match engine.multiply(&product, &a) {
        Err(FracError::NoiseBudgetExhausted { available, required }) => {
            assert_eq!(engine.noise_budget(&product), available);
            assert_eq!(threshold, required);
        },
        other => panic!("expected NoiseBudgetExhausted, got {:?}", other)
    }
    assert!(matches!(engine.multiply(&product, &product), Err(FracError::NoiseBudgetExhausted { .. })));
}

#[test]
fn test_plain_multiply_until_exhausted() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(7);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let codec = public.params().codec();
    let factor = codec.encode_ratio(1, 6).unwrap();

    let mut current = public.encrypt_value(&RationalValue::from_integer(1, 3), &mut rng).unwrap();
    let mut steps = 0;
    let error = loop {
        match engine.multiply_plain(&current, &factor) {
            Ok(next) => {
                assert!(engine.noise_budget(&next) > 0);
                assert_ne!(CiphertextState::Exhausted, next.state(public.params()));
                current = next;
                steps += 1;
            },
            Err(e) => break e
        }
        assert!(steps < 100);
    };
    assert!(matches!(error, FracError::NoiseBudgetExhausted { .. }));
    assert!(steps >= 1);
    assert_eq!(steps, current.depth());
    // the last result is still within the budget, so it decrypts without error
    assert!(secret.measured_noise_budget(&current) > 0);
}

#[test]
fn test_sum_many() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(8);
    let mut data_rng = oorandom::Rand64::new(8);
    let values = (0..7).map(|_| RationalValue::from_ratio(data_rng.rand_i64() % 1000, 81, 3, 4).unwrap()).collect::<Vec<_>>();
    let cts = values.iter().map(|x| public.encrypt_value(x, &mut rng).unwrap()).collect::<Vec<_>>();
    let expected = values.iter().fold(RationalValue::from_integer(0, 3), |current, x| current.add(x));

    let sequential = HomomorphicArithmeticEngine::new(&public).with_sum_strategy(SumStrategy::Sequential);
    let balanced = HomomorphicArithmeticEngine::new(&public).with_sum_strategy(SumStrategy::BalancedTree);
    let sequential_sum = sequential.sum_many(&cts).unwrap();
    let balanced_sum = balanced.sum_many(&cts).unwrap();
    assert_eq!(expected, secret.decrypt_value(&sequential_sum).unwrap());
    assert_eq!(expected, secret.decrypt_value(&balanced_sum).unwrap());
    assert_eq!(6, sequential_sum.operation_count());
    assert_eq!(6, balanced_sum.operation_count());

    assert_eq!(values[3], secret.decrypt_value(&balanced.sum_many(&cts[3..4]).unwrap()).unwrap());
    assert!(matches!(balanced.sum_many(&[]), Err(FracError::InvalidArgument(_))));
    assert!(matches!(sequential.sum_many(&[]), Err(FracError::InvalidArgument(_))));
}

#[test]
fn test_weighted_average() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(9);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let codec = public.params().codec();

    let values = [10, 20, 30].iter().map(|x| public.encrypt_value(&RationalValue::from_integer(*x, 3), &mut rng).unwrap()).collect::<Vec<_>>();
    let weights = [1, 2, 3].iter().map(|w| codec.encode_integer(*w).unwrap()).collect::<Vec<_>>();
    let divisor = codec.encode_ratio(1, 6).unwrap();

    let predicted = public.params().predict_weighted_average_budget(&values, &weights, &divisor).unwrap();
    let result = engine.weighted_average(&values, &weights, &divisor).unwrap();
    assert_eq!(predicted, engine.noise_budget(&result));
    assert_eq!(2, result.depth());

    let sequential = HomomorphicArithmeticEngine::new(&public).with_sum_strategy(SumStrategy::Sequential);
    let sequential_result = sequential.weighted_average(&values, &weights, &divisor).unwrap();
    let predicted_noise = public.params().predict_weighted_average_noise(&values, &weights, &divisor, SumStrategy::Sequential).unwrap();
    assert_eq!(predicted_noise, *sequential_result.noise());

    let average = secret.decrypt_value(&result).unwrap();
    assert!((average.to_f64() - 140. / 6.).abs() <= 140. * 3f64.powi(-32) / 2. * 1.01);
    // the only error is the rounding of the divisor
    let expected = RationalValue::from_integer(140, 3).mul(&RationalValue::from_ratio(1, 6, 3, 32).unwrap());
    assert_eq!(expected, average);
}

#[test]
fn test_weighted_average_invalid() {
    let (public, _secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(10);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let codec = public.params().codec();

    let values = [1, 2].iter().map(|x| public.encrypt_value(&RationalValue::from_integer(*x, 3), &mut rng).unwrap()).collect::<Vec<_>>();
    let weights = vec![codec.encode_integer(1).unwrap()];
    let divisor = codec.encode_integer(1).unwrap();
    assert!(matches!(engine.weighted_average(&values, &weights, &divisor), Err(FracError::InvalidArgument(_))));
    assert!(matches!(engine.weighted_average(&[], &[], &divisor), Err(FracError::InvalidArgument(_))));

    // after a ciphertext multiplication, there is not enough budget left for two expensive plaintext multiplications
    let products = vec![engine.multiply(&values[0], &values[1]).unwrap(), engine.multiply(&values[1], &values[0]).unwrap()];
    let weights = vec![codec.encode_ratio(1, 6).unwrap(), codec.encode_ratio(1, 6).unwrap()];
    let divisor = codec.encode_ratio(1, 6).unwrap();
    assert_eq!(0, public.params().predict_weighted_average_budget(&products, &weights, &divisor).unwrap());
    match engine.weighted_average(&products, &weights, &divisor) {
        Err(FracError::NoiseBudgetExhausted { available, required }) => {
            assert_eq!(engine.noise_budget(&products[0]), available);
            // two multiplications by `1/6` consume at least 10 bits
            assert!(required > 10);
            assert!(required > available);
        },
        other => panic!("expected NoiseBudgetExhausted, got {:?}", other)
    }
}

#[test]
fn test_add_refuses_to_exhaust() {
    let (public, secret) = test_contexts(1);
    let mut rng = StdRng::seed_from_u64(11);
    let engine = HomomorphicArithmeticEngine::new(&public);
    let two = public.params().codec().encode_integer(2).unwrap();

    // every multiplication by `2` costs exactly one bit, so this ends with exactly one bit left
    let mut current = public.encrypt_value(&RationalValue::from_integer(1, 3), &mut rng).unwrap();
    while let Ok(next) = engine.multiply_plain(&current, &two) {
        current = next;
    }
    assert_eq!(1, engine.noise_budget(&current));
    assert!(secret.measured_noise_budget(&current) > 0);

    match engine.add(&current, &current) {
        Err(FracError::NoiseBudgetExhausted { available, required }) => {
            assert_eq!(1, available);
            assert_eq!(2, required);
        },
        other => panic!("expected NoiseBudgetExhausted, got {:?}", other)
    }
    let copy = public.clone_ciphertext(&current);
    assert!(matches!(engine.add_owned(copy, &current), Err(FracError::NoiseBudgetExhausted { .. })));
    assert!(matches!(engine.subtract(&current, &current), Err(FracError::NoiseBudgetExhausted { .. })));

    let cts = vec![public.clone_ciphertext(&current), public.clone_ciphertext(&current)];
    assert!(matches!(engine.sum_many(&cts), Err(FracError::NoiseBudgetExhausted { .. })));
    let sequential = HomomorphicArithmeticEngine::new(&public).with_sum_strategy(SumStrategy::Sequential);
    assert!(matches!(sequential.sum_many(&cts), Err(FracError::NoiseBudgetExhausted { .. })));
}
