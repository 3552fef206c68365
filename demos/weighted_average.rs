use std::sync::Arc;

use frac_he::*;
use rand::thread_rng;
use tracing::Level;

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let params = Arc::new(ParameterContext::new(FracParams::default())?);
    print!("{}", params.summary());

    let (public, secret) = params.clone().generate_keys(thread_rng());
    let engine = HomomorphicArithmeticEngine::new(&public);
    let codec = params.codec();

    // the data owner encrypts its values
    let values = [31, 61, 90, -14].iter().map(|x| RationalValue::from_ratio(*x, 3, 3, 1)).collect::<Result<Vec<_>>>()?;
    let encrypted = public.encrypt_values(&values)?;

    // the evaluator only knows the weights
    let weights = [1, 2, 3, 4];
    let encoded_weights = weights.iter().map(|w| codec.encode_integer(*w)).collect::<Result<Vec<_>>>()?;
    let divisor = codec.encode_ratio(1, weights.iter().sum())?;
    println!("expected noise budget of the result: {} bits", params.predict_weighted_average_budget(&encrypted, &encoded_weights, &divisor)?);
    let result = engine.weighted_average(&encrypted, &encoded_weights, &divisor)?;

    let average = secret.decrypt_value(&result)?;
    let expected = values.iter().zip(weights.iter()).map(|(x, w)| x.to_f64() * *w as f64).sum::<f64>() / weights.iter().sum::<i64>() as f64;
    println!("weighted average: {} (expected {})", average.to_f64(), expected);
    println!("remaining noise budget: {} bits estimated, {} bits measured", engine.noise_budget(&result), secret.measured_noise_budget(&result));
    return Ok(());
}
