#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

#![doc = include_str!("../Readme.md")]

extern crate feanor_math;

///
/// Contains [`error::FracError`], the error type of all fallible operations.
///
pub mod error;

///
/// A compact, textbook implementation of BFV over `Z[X]/(X^N + 1)`, which is
/// the cryptographic primitive that everything else is built on.
///
pub mod bfv;

///
/// Public estimation of the noise growth of BFV operations.
///
pub mod noise_estimator;

///
/// Contains [`params::ParameterContext`], which chooses and validates the ring
/// dimension, coefficient modulus and plaintext modulus.
///
pub mod params;

///
/// Contains [`codec::FractionalCodec`], which encodes rationals as plaintext
/// ring elements using a balanced base-`B` digit expansion.
///
pub mod codec;

///
/// Key material, split into [`context::PublicContext`] (encrypt and evaluate)
/// and [`context::SecretContext`] (decrypt).
///
pub mod context;

///
/// Contains [`engine::HomomorphicArithmeticEngine`], which implements arithmetic
/// on encrypted rationals.
///
pub mod engine;

pub use error::{FracError, Result};
pub use params::{ParameterContext, FracParams, EncodingPrecision, SecurityLevel};
pub use codec::{FractionalCodec, RationalValue, PlaintextElement};
pub use context::{Ciphertext, CiphertextState, PublicContext, SecretContext, EncryptionPort, DecryptionPort};
pub use engine::{HomomorphicArithmeticEngine, SumStrategy};
