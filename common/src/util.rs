use regex::Regex;

use crate::error::ParseError;

/// Arithmetic mean; an empty slice averages to `0.0`.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Extracts the first capture group of the first match of `pattern` as a number.
pub fn parse_measurement(output: &str, pattern: &Regex) -> Result<f64, ParseError> {
    let captured = pattern
        .captures(output)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| ParseError::Unparseable {
            output: output.to_owned(),
            pattern: pattern.as_str().to_owned(),
        })?
        .as_str();

    captured
        .trim()
        .parse::<f64>()
        .map_err(|_| ParseError::NonNumeric {
            output: output.to_owned(),
            pattern: pattern.as_str().to_owned(),
            captured: captured.to_owned(),
        })
}

/// `reference / y` for every point, where `reference` is the first measurement.
pub fn speedup(series: &[f64]) -> Vec<f64> {
    let Some(reference) = series.first() else {
        return Vec::new();
    };
    series.iter().map(|y| reference / y).collect()
}

/// Speedup divided by the sweep value.
pub fn efficiency(x_data: &[i64], series: &[f64]) -> Vec<f64> {
    speedup(series)
        .into_iter()
        .zip(x_data)
        .map(|(s, x)| s / *x as f64)
        .collect()
}
