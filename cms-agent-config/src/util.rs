use std::time::Duration;

pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `"90s"`, `"6h"`, `"1h 30m"`; a bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(|err| err.to_string())
}

/// Fractional hours as used by the legacy `CMS_CHECK_INTERVAL` variable.
pub fn parse_hours(raw: &str) -> Result<Duration, String> {
    let hours: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("`{raw}` is not a number of hours"))?;
    if !hours.is_finite() || hours < 0.0 {
        return Err(format!("`{raw}` is not a non-negative number of hours"));
    }
    Ok(Duration::from_millis((hours * 3_600_000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_humantime_and_bare_seconds() {
        assert_eq!(parse_duration("90"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("6h"), Ok(Duration::from_secs(6 * 3600)));
        assert_eq!(parse_duration("1h 30m"), Ok(Duration::from_secs(5400)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn legacy_hours_allow_fractions() {
        assert_eq!(parse_hours("0.1"), Ok(Duration::from_secs(360)));
        assert_eq!(parse_hours("6"), Ok(Duration::from_secs(21_600)));
        assert!(parse_hours("-1").is_err());
        assert!(parse_hours("six").is_err());
    }

    #[test]
    fn csv_drops_blank_entries() {
        assert_eq!(parse_csv(" a, ,b,"), vec!["a".to_string(), "b".to_string()]);
    }
}
