use std::time::Duration;

use anyhow::{Result, anyhow, bail};

/// Parses duration strings of the form `500ms`, `30s`, `5m`, `3h` or `1d`.
/// A bare `0` is accepted without a unit.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let compact = input
        .chars()
        .filter(|character| !character.is_ascii_whitespace())
        .collect::<String>();

    if compact.is_empty() {
        bail!("duration must not be empty");
    }
    if compact == "0" {
        return Ok(Duration::ZERO);
    }

    let split_index = compact
        .char_indices()
        .find_map(|(index, character)| {
            if character.is_ascii_digit() {
                None
            } else {
                Some(index)
            }
        })
        .ok_or_else(|| anyhow!("duration must include a unit suffix"))?;

    let value_text = &compact[..split_index];
    let unit = compact[split_index..].to_ascii_lowercase();
    if value_text.is_empty() {
        bail!("duration must include a numeric value and a unit suffix");
    }

    let amount: u64 = value_text
        .parse()
        .map_err(|_| anyhow!("invalid duration value: {value_text}"))?;

    let seconds = |multiplier: u64| {
        amount
            .checked_mul(multiplier)
            .map(Duration::from_secs)
            .ok_or_else(|| anyhow!("duration is too large"))
    };

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(3600),
        "d" => seconds(86_400),
        _ => bail!("unsupported duration unit: {unit}"),
    }
}
