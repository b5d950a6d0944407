use std::time::Duration;

/// Parse a human duration such as `250ms`, `30s`, `5m` or `1h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    if digits.is_empty() {
        return Err(format!("invalid duration '{}': missing number", input));
    }
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration '{}': {}", input, e))?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        other => {
            return Err(format!(
                "invalid duration '{}': unknown unit '{}' (use ms, s, m or h)",
                input, other
            ))
        }
    };
    Ok(duration)
}
