use thiserror::Error;

///
/// Everything that can go wrong when encoding, encrypting or computing on
/// encrypted fractional values.
///
/// None of these errors is recoverable by retrying, since all operations
/// are deterministic given their inputs.
///
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FracError {

    /// Malformed ring dimension, coefficient modulus, plaintext modulus or precision
    #[error("invalid parameters: {0}")]
    ParameterInvalid(String),

    #[error("value {value} cannot be encoded with {integer_slots} integer and {fraction_slots} fractional base-{base} digits")]
    PrecisionOverflow {
        value: String,
        integer_slots: usize,
        fraction_slots: usize,
        base: u64
    },

    ///
    /// A homomorphic operation was refused since the (estimated) noise budget
    /// of an operand is below what the operation needs. This is raised before
    /// the operation is performed.
    ///
    #[error("noise budget exhausted: {available} bits available, {required} bits required")]
    NoiseBudgetExhausted {
        available: usize,
        required: usize
    },

    ///
    /// A plaintext coefficient lies on the wrap-around boundary of `Z/tZ`, so
    /// its sign (and hence the decoded value) is ambiguous. This is usually the
    /// symptom of coefficient growth during homomorphic operations.
    ///
    #[error("coefficient {coefficient} at index {index} is outside of the decodable digit range")]
    DecodeMismatch {
        index: usize,
        coefficient: i64
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String)
}

pub type Result<T> = std::result::Result<T, FracError>;

#[test]
fn test_error_messages() {
    let err = FracError::NoiseBudgetExhausted { available: 3, required: 21 };
    assert_eq!("noise budget exhausted: 3 bits available, 21 bits required", err.to_string());
    let err = FracError::DecodeMismatch { index: 7, coefficient: -128 };
    assert_eq!("coefficient -128 at index 7 is outside of the decodable digit range", err.to_string());
}
