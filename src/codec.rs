use std::fmt::{Debug, Display, Formatter};

use feanor_math::divisibility::DivisibilityRingStore;
use feanor_math::homomorphism::*;
use feanor_math::integer::*;
use feanor_math::ordered::OrderedRingStore;
use feanor_math::pid::EuclideanRingStore;
use feanor_math::primitive_int::StaticRing;
use feanor_math::ring::*;
use feanor_math::rings::extension::FreeAlgebraStore;
use feanor_math::rings::zn::*;
use feanor_math::seq::*;

use tracing::warn;

use crate::bfv::{PlaintextRing, create_plaintext_ring};
use crate::error::{FracError, Result};
use crate::params::EncodingPrecision;

const ZZbig: BigIntRing = BigIntRing::RING;
const ZZ: StaticRing<i64> = StaticRing::<i64>::RING;

fn big(x: i64) -> El<BigIntRing> {
    int_cast(x, ZZbig, ZZ)
}

fn abs(x: El<BigIntRing>) -> El<BigIntRing> {
    if ZZbig.is_neg(&x) { ZZbig.negate(x) } else { x }
}

///
/// An exact signed rational of the form `mantissa / base^scale`.
///
/// Two values compare equal if they represent the same rational number, even if they
/// use different bases or scales.
///
pub struct RationalValue {
    mantissa: El<BigIntRing>,
    base: u64,
    scale: usize
}

impl RationalValue {

    pub fn new(mantissa: El<BigIntRing>, base: u64, scale: usize) -> Self {
        assert!(base >= 2);
        Self { mantissa, base, scale }
    }

    pub fn from_integer(value: i64, base: u64) -> Self {
        Self::new(big(value), base, 0)
    }

    ///
    /// Returns the multiple of `base^-scale` that is closest to `value`.
    ///
    /// The conversion is exact, i.e. `value` is interpreted as the dyadic rational
    /// it represents, and only the final rounding introduces an error.
    ///
    pub fn from_f64(value: f64, base: u64, scale: usize) -> Result<Self> {
        if !value.is_finite() {
            return Err(FracError::InvalidArgument(format!("cannot encode non-finite value {}", value)));
        }
        let bits = value.to_bits();
        let biased_exponent = ((bits >> 52) & 0x7FF) as i64;
        let fraction = (bits & ((1 << 52) - 1)) as i64;
        // `value = significand * 2^exponent`
        let (significand, exponent) = if biased_exponent == 0 {
            (fraction, -1074)
        } else {
            (fraction | (1 << 52), biased_exponent - 1075)
        };
        let mut numerator = ZZbig.mul(big(significand), ZZbig.pow(big(base as i64), scale));
        if (bits >> 63) != 0 {
            ZZbig.negate_inplace(&mut numerator);
        }
        let mantissa = if exponent >= 0 {
            ZZbig.mul(numerator, ZZbig.power_of_two(exponent as usize))
        } else {
            ZZbig.rounded_div(numerator, &ZZbig.power_of_two((-exponent) as usize))
        };
        return Ok(Self::new(mantissa, base, scale));
    }

    ///
    /// Returns the multiple of `base^-scale` that is closest to `numerator / denominator`.
    ///
    pub fn from_ratio(numerator: i64, denominator: i64, base: u64, scale: usize) -> Result<Self> {
        if denominator == 0 {
            return Err(FracError::InvalidArgument(format!("ratio {}/0 is undefined", numerator)));
        }
        let (mut numerator, mut denominator) = (big(numerator), big(denominator));
        if ZZbig.is_neg(&denominator) {
            ZZbig.negate_inplace(&mut numerator);
            ZZbig.negate_inplace(&mut denominator);
        }
        let mantissa = ZZbig.rounded_div(ZZbig.mul(numerator, ZZbig.pow(big(base as i64), scale)), &denominator);
        return Ok(Self::new(mantissa, base, scale));
    }

    pub fn mantissa(&self) -> &El<BigIntRing> {
        &self.mantissa
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn is_zero(&self) -> bool {
        ZZbig.is_zero(&self.mantissa)
    }

    fn denominator(&self) -> El<BigIntRing> {
        ZZbig.pow(big(self.base as i64), self.scale)
    }

    fn mantissa_at_scale(&self, scale: usize) -> El<BigIntRing> {
        assert!(scale >= self.scale);
        ZZbig.mul_ref_fst(&self.mantissa, ZZbig.pow(big(self.base as i64), scale - self.scale))
    }

    pub fn add(&self, other: &RationalValue) -> RationalValue {
        assert_eq!(self.base, other.base, "cannot add rationals w.r.t. different bases");
        let scale = usize::max(self.scale, other.scale);
        Self::new(ZZbig.add(self.mantissa_at_scale(scale), other.mantissa_at_scale(scale)), self.base, scale)
    }

    pub fn neg(&self) -> RationalValue {
        Self::new(ZZbig.negate(ZZbig.clone_el(&self.mantissa)), self.base, self.scale)
    }

    pub fn sub(&self, other: &RationalValue) -> RationalValue {
        self.add(&other.neg())
    }

    pub fn mul(&self, other: &RationalValue) -> RationalValue {
        assert_eq!(self.base, other.base, "cannot multiply rationals w.r.t. different bases");
        Self::new(ZZbig.mul_ref(&self.mantissa, &other.mantissa), self.base, self.scale + other.scale)
    }

    ///
    /// Rounds to the closest multiple of `base^-scale`.
    ///
    pub fn round_to(&self, scale: usize) -> RationalValue {
        if scale >= self.scale {
            Self::new(self.mantissa_at_scale(scale), self.base, scale)
        } else {
            let divisor = ZZbig.pow(big(self.base as i64), self.scale - scale);
            Self::new(ZZbig.rounded_div(ZZbig.clone_el(&self.mantissa), &divisor), self.base, scale)
        }
    }

    ///
    /// Returns the closest `f64`, up to rounding errors in the last bits.
    ///
    pub fn to_f64(&self) -> f64 {
        if self.is_zero() {
            return 0.;
        }
        let denominator = self.denominator();
        // scale such that the quotient has about 60 bits
        let shift = ZZbig.abs_log2_ceil(&denominator).unwrap_or(0) as i64 - ZZbig.abs_log2_ceil(&self.mantissa).unwrap() as i64 + 60;
        let quotient = if shift >= 0 {
            ZZbig.rounded_div(ZZbig.mul_ref_fst(&self.mantissa, ZZbig.power_of_two(shift as usize)), &denominator)
        } else {
            ZZbig.rounded_div(ZZbig.clone_el(&self.mantissa), &ZZbig.mul(denominator, ZZbig.power_of_two((-shift) as usize)))
        };
        return int_cast(quotient, ZZ, ZZbig) as f64 * (-shift as f64).exp2();
    }
}

impl Clone for RationalValue {

    fn clone(&self) -> Self {
        Self::new(ZZbig.clone_el(&self.mantissa), self.base, self.scale)
    }
}

impl PartialEq for RationalValue {

    fn eq(&self, other: &Self) -> bool {
        ZZbig.eq_el(
            &ZZbig.mul_ref_snd(self.denominator(), &other.mantissa),
            &ZZbig.mul_ref_snd(other.denominator(), &self.mantissa)
        )
    }
}

impl Display for RationalValue {

    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.scale == 0 {
            write!(f, "{}", ZZbig.format(&self.mantissa))
        } else {
            write!(f, "{} / {}^{}", ZZbig.format(&self.mantissa), self.base, self.scale)
        }
    }
}

impl Debug for RationalValue {

    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RationalValue({} ~ {})", self, self.to_f64())
    }
}

///
/// An element of the plaintext ring `Z_t[X]/(X^N + 1)`, as produced by a [`FractionalCodec`].
///
/// Cloning and comparing requires the ring, see [`FractionalCodec::clone_element()`] and
/// [`FractionalCodec::eq_element()`].
///
pub struct PlaintextElement {
    element: El<PlaintextRing>
}

impl PlaintextElement {

    pub(crate) fn from_element(element: El<PlaintextRing>) -> Self {
        Self { element }
    }

    pub fn element(&self) -> &El<PlaintextRing> {
        &self.element
    }
}

///
/// Encodes rationals as elements of `Z_t[X]/(X^N + 1)`, such that ring addition and
/// multiplication correspond to addition and multiplication of the encoded values,
/// as long as no coefficient leaves the range `[-(t-1)/2, (t-1)/2]`.
///
/// A value `x` is scaled to `x base^fraction_slots`, which must be an integer, and that
/// integer is expanded in balanced base-`base` digits, i.e. digits in
/// `[-(base - 1)/2, (base - 1)/2]`. The digit of `base^i` becomes the coefficient of `X^i`,
/// and the digit of `base^-k` becomes the coefficient of `X^(N - k)` with flipped sign,
/// since `X^-k = -X^(N - k)`. Since homomorphic multiplication adds exponents, the
/// integer part grows upwards from `X^0` and the fractional part downwards from `X^N`;
/// when decoding, the lower half of the coefficients is interpreted as integer part,
/// the upper half as fractional part.
///
pub struct FractionalCodec {
    ring: PlaintextRing,
    precision: EncodingPrecision
}

impl FractionalCodec {

    pub fn new(ring_degree: usize, plain_modulus: u64, precision: EncodingPrecision) -> Result<Self> {
        precision.validate()?;
        if !ring_degree.is_power_of_two() || ring_degree < 2 {
            return Err(FracError::ParameterInvalid(format!("ring degree must be a power of two, got {}", ring_degree)));
        }
        if plain_modulus < precision.base {
            return Err(FracError::ParameterInvalid(format!("plaintext modulus {} cannot represent balanced base-{} digits", plain_modulus, precision.base)));
        }
        if precision.integer_slots + precision.fraction_slots > ring_degree / 2 {
            return Err(FracError::ParameterInvalid(format!(
                "{} integer and {} fractional digits do not fit into ring degree {}",
                precision.integer_slots, precision.fraction_slots, ring_degree
            )));
        }
        return Ok(Self {
            ring: create_plaintext_ring(ring_degree, plain_modulus),
            precision
        });
    }

    pub fn ring(&self) -> &PlaintextRing {
        &self.ring
    }

    pub fn precision(&self) -> &EncodingPrecision {
        &self.precision
    }

    fn overflow(&self, value: &RationalValue) -> FracError {
        FracError::PrecisionOverflow {
            value: value.to_string(),
            integer_slots: self.precision.integer_slots,
            fraction_slots: self.precision.fraction_slots,
            base: self.precision.base
        }
    }

    pub fn encode(&self, value: &RationalValue) -> Result<PlaintextElement> {
        let N = self.ring.rank();
        let I = self.precision.integer_slots;
        let F = self.precision.fraction_slots;
        let base = self.precision.base as i64;

        // `value * base^F` must be integral
        let scaled = ZZbig.checked_div(
            &ZZbig.mul_ref_fst(&value.mantissa, ZZbig.pow(big(base), F)),
            &value.denominator()
        ).ok_or_else(|| self.overflow(value))?;

        let negative = ZZbig.is_neg(&scaled);
        let mut remaining = abs(scaled);
        let mut digits: Vec<i64> = Vec::new();
        while !ZZbig.is_zero(&remaining) {
            if digits.len() == I + F {
                return Err(self.overflow(value));
            }
            let (quotient, remainder) = ZZbig.euclidean_div_rem(remaining, &big(base));
            remaining = quotient;
            let mut digit = int_cast(remainder, ZZ, ZZbig);
            if digit > base / 2 {
                digit -= base;
                ZZbig.add_assign(&mut remaining, ZZbig.one());
            }
            digits.push(if negative { -digit } else { digit });
        }

        let mut coefficients = vec![0; N];
        for (k, digit) in digits.into_iter().enumerate() {
            if k >= F {
                coefficients[k - F] = digit;
            } else {
                coefficients[N - (F - k)] = -digit;
            }
        }
        let hom = self.ring.base_ring().int_hom();
        return Ok(PlaintextElement::from_element(self.ring.from_canonical_basis(coefficients.into_iter().map(|c| hom.map(c as i32)))));
    }

    pub fn encode_many(&self, values: &[RationalValue]) -> Result<Vec<PlaintextElement>> {
        values.iter().map(|x| self.encode(x)).collect()
    }

    ///
    /// Encodes the closest multiple of `base^-fraction_slots` to `value`.
    ///
    pub fn encode_f64(&self, value: f64) -> Result<PlaintextElement> {
        self.encode(&RationalValue::from_f64(value, self.precision.base, self.precision.fraction_slots)?)
    }

    pub fn encode_integer(&self, value: i64) -> Result<PlaintextElement> {
        self.encode(&RationalValue::from_integer(value, self.precision.base))
    }

    ///
    /// Encodes the closest multiple of `base^-fraction_slots` to `numerator / denominator`.
    ///
    pub fn encode_ratio(&self, numerator: i64, denominator: i64) -> Result<PlaintextElement> {
        self.encode(&RationalValue::from_ratio(numerator, denominator, self.precision.base, self.precision.fraction_slots)?)
    }

    ///
    /// Reconstructs the encoded rational exactly. The result may have more than
    /// `fraction_slots` fractional digits, e.g. if it is the result of a multiplication.
    ///
    pub fn decode(&self, element: &PlaintextElement) -> Result<RationalValue> {
        let N = self.ring.rank();
        let Zt = self.ring.base_ring();
        let max_digit = (*Zt.modulus() - 1) / 2;
        let coefficients = self.ring.wrt_canonical_basis(&element.element);

        // `(exponent, digit)` pairs
        let mut digits: Vec<(i64, i64)> = Vec::new();
        for i in 0..N {
            let c = Zt.smallest_lift(coefficients.at(i));
            if c.abs() > max_digit {
                warn!("coefficient {} at index {} is on the wrap-around boundary", c, i);
                return Err(FracError::DecodeMismatch { index: i, coefficient: c });
            }
            if c == 0 {
                continue;
            } else if i < N / 2 {
                digits.push((i as i64, c));
            } else {
                digits.push((i as i64 - N as i64, -c));
            }
        }

        let base = self.precision.base;
        let (Some(max_exponent), Some(min_exponent)) = (digits.iter().map(|(e, _)| *e).max(), digits.iter().map(|(e, _)| *e).min()) else {
            return Ok(RationalValue::from_integer(0, base));
        };
        let scale = if min_exponent < 0 { (-min_exponent) as usize } else { 0 };
        let mut dense = vec![0; (max_exponent - min_exponent + 1) as usize];
        for (e, d) in digits {
            dense[(e - min_exponent) as usize] = d;
        }
        let B = big(base as i64);
        let mut mantissa = ZZbig.zero();
        for d in dense.into_iter().rev() {
            mantissa = ZZbig.add(ZZbig.mul_ref_snd(mantissa, &B), big(d));
        }
        if min_exponent > 0 {
            ZZbig.mul_assign(&mut mantissa, ZZbig.pow(B, min_exponent as usize));
        }
        return Ok(RationalValue::new(mantissa, base, scale));
    }

    ///
    /// Decodes, and rounds the result to the closest multiple of `base^-fraction_slots`.
    ///
    pub fn decode_rounded(&self, element: &PlaintextElement) -> Result<RationalValue> {
        Ok(self.decode(element)?.round_to(self.precision.fraction_slots))
    }

    pub fn zero(&self) -> PlaintextElement {
        PlaintextElement::from_element(self.ring.zero())
    }

    pub fn clone_element(&self, element: &PlaintextElement) -> PlaintextElement {
        PlaintextElement::from_element(self.ring.clone_el(&element.element))
    }

    pub fn eq_element(&self, lhs: &PlaintextElement, rhs: &PlaintextElement) -> bool {
        self.ring.eq_el(&lhs.element, &rhs.element)
    }
}

#[cfg(test)]
use feanor_math::assert_el_eq;

#[cfg(test)]
fn small_codec() -> FractionalCodec {
    FractionalCodec::new(16, 256, EncodingPrecision { integer_slots: 4, fraction_slots: 2, base: 3 }).unwrap()
}

#[test]
fn test_encode_digit_layout() {
    let codec = small_codec();
    let P = codec.ring();

    // 13/3 = 1*3 + 1 + 1/3
    let value = RationalValue::from_ratio(13, 3, 3, 2).unwrap();
    let mut expected = [0; 16];
    expected[0] = 1;
    expected[1] = 1;
    expected[15] = -1;
    assert_el_eq!(P, &P.from_canonical_basis(expected.iter().map(|c| P.base_ring().int_hom().map(*c))), codec.encode(&value).unwrap().element());

    let negated = value.neg();
    assert_el_eq!(P, &P.from_canonical_basis(expected.iter().map(|c| P.base_ring().int_hom().map(-*c))), codec.encode(&negated).unwrap().element());

    // 2 = 3 - 1
    let mut expected = [0; 16];
    expected[0] = -1;
    expected[1] = 1;
    assert_el_eq!(P, &P.from_canonical_basis(expected.iter().map(|c| P.base_ring().int_hom().map(*c))), codec.encode_integer(2).unwrap().element());

    assert!(codec.eq_element(&codec.zero(), &codec.encode_integer(0).unwrap()));
}

#[test]
fn test_encode_decode_random() {
    let mut rng = oorandom::Rand64::new(1);
    let codec = FractionalCodec::new(2048, 256, EncodingPrecision::default()).unwrap();
    for _ in 0..100 {
        let mantissa = ZZbig.mul(big(rng.rand_i64()), big(rng.rand_i64()));
        let scale = rng.rand_range(0..33) as usize;
        let value = RationalValue::new(mantissa, 3, scale);
        let decoded = codec.decode(&codec.encode(&value).unwrap()).unwrap();
        assert_eq!(value, decoded);
    }
    for _ in 0..100 {
        let x = (rng.rand_float() - 0.5) * 1e6;
        let decoded = codec.decode(&codec.encode_f64(x).unwrap()).unwrap();
        assert_eq!(RationalValue::from_f64(x, 3, 32).unwrap(), decoded);
        assert!((decoded.to_f64() - x).abs() <= 1e-9);
    }
}

#[test]
fn test_encode_precision_overflow() {
    let codec = FractionalCodec::new(2048, 256, EncodingPrecision::default()).unwrap();
    let B = big(3);

    let too_large = RationalValue::new(ZZbig.pow(ZZbig.clone_el(&B), 64), 3, 0);
    assert!(matches!(codec.encode(&too_large), Err(FracError::PrecisionOverflow { integer_slots: 64, fraction_slots: 32, base: 3, .. })));
    assert!(codec.encode(&too_large.neg()).is_err());

    // the largest value with 64 balanced ternary digits is `(3^64 - 1) / 2`
    let largest = RationalValue::new(ZZbig.checked_div(&ZZbig.sub(ZZbig.pow(ZZbig.clone_el(&B), 64), ZZbig.one()), &big(2)).unwrap(), 3, 0);
    assert_eq!(largest, codec.decode(&codec.encode(&largest).unwrap()).unwrap());

    let too_fine = RationalValue::new(big(1), 3, 33);
    assert!(matches!(codec.encode(&too_fine), Err(FracError::PrecisionOverflow { .. })));
    let fine_enough = RationalValue::new(big(3), 3, 33);
    assert_eq!(fine_enough, codec.decode(&codec.encode(&fine_enough).unwrap()).unwrap());

    let half = RationalValue::new(big(1), 2, 1);
    assert!(codec.encode(&half).is_err());
}

#[test]
fn test_decode_product() {
    let codec = small_codec();
    let P = codec.ring();
    let third = codec.encode(&RationalValue::new(big(1), 3, 1)).unwrap();
    let ninth = PlaintextElement::from_element(P.mul_ref(third.element(), third.element()));
    let decoded = codec.decode(&ninth).unwrap();
    assert_eq!(RationalValue::new(big(1), 3, 2), decoded);
    assert_eq!(2, decoded.scale());
    let twentyseventh = PlaintextElement::from_element(P.mul_ref(ninth.element(), third.element()));
    assert_eq!(RationalValue::new(big(1), 3, 3), codec.decode(&twentyseventh).unwrap());
    assert!(codec.decode_rounded(&twentyseventh).unwrap().is_zero());

    let product = PlaintextElement::from_element(P.mul(codec.encode_integer(-4).unwrap().element, codec.encode_ratio(7, 3).unwrap().element));
    assert_eq!(RationalValue::from_ratio(-28, 3, 3, 1).unwrap(), codec.decode(&product).unwrap());
}

#[test]
fn test_decode_mismatch() {
    let codec = small_codec();
    let P = codec.ring();
    let element = PlaintextElement::from_element(P.from_canonical_basis((0..16).map(|i| P.base_ring().int_hom().map(if i == 7 { 128 } else { 0 }))));
    assert!(matches!(codec.decode(&element), Err(FracError::DecodeMismatch { index: 7, .. })));

    let element = PlaintextElement::from_element(P.from_canonical_basis((0..16).map(|i| P.base_ring().int_hom().map(if i == 7 { 127 } else { 0 }))));
    assert_eq!(RationalValue::new(ZZbig.mul(big(127), ZZbig.pow(big(3), 7)), 3, 0), codec.decode(&element).unwrap());
}

#[test]
fn test_invalid_codec() {
    assert!(FractionalCodec::new(16, 256, EncodingPrecision { integer_slots: 6, fraction_slots: 3, base: 3 }).is_err());
    assert!(FractionalCodec::new(16, 4, EncodingPrecision { integer_slots: 2, fraction_slots: 2, base: 5 }).is_err());
    assert!(FractionalCodec::new(16, 5, EncodingPrecision { integer_slots: 2, fraction_slots: 2, base: 5 }).is_ok());
    assert!(FractionalCodec::new(12, 256, EncodingPrecision { integer_slots: 2, fraction_slots: 2, base: 3 }).is_err());
}

#[test]
fn test_rational_value() {
    let a = RationalValue::from_f64(3.5, 3, 32).unwrap();
    let b = RationalValue::from_f64(-1.25, 3, 32).unwrap();
    assert!((a.add(&b).to_f64() - 2.25).abs() < 1e-12);
    assert_eq!(RationalValue::from_integer(6, 3), RationalValue::new(big(54), 3, 2));
    assert_eq!(RationalValue::from_integer(-6, 3), RationalValue::new(big(-12), 2, 1));
    assert_eq!(RationalValue::new(big(1), 3, 1), RationalValue::from_ratio(-2, -6, 3, 5).unwrap().round_to(1));
    assert_eq!(-0.5, RationalValue::from_f64(-0.5, 2, 1).unwrap().to_f64());
    assert_eq!(1e300, RationalValue::from_f64(1e300, 3, 0).unwrap().to_f64());
    assert!(RationalValue::from_f64(f64::NAN, 3, 0).is_err());
    assert!(RationalValue::from_ratio(1, 0, 3, 0).is_err());

    // negating `i64::MIN` does not fit into an `i64`
    assert_eq!(RationalValue::new(ZZbig.power_of_two(63), 3, 0), RationalValue::from_ratio(i64::MIN, -1, 3, 0).unwrap());
    assert_eq!(RationalValue::from_integer(1, 3), RationalValue::from_ratio(i64::MIN, i64::MIN, 3, 0).unwrap());
    assert!(RationalValue::from_ratio(-1, i64::MIN, 3, 0).unwrap().is_zero());
}
