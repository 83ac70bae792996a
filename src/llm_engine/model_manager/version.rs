//! Client version gate for downloadable models

use std::cmp::Ordering;

fn parse_version(version: &str) -> Result<Vec<u64>, String> {
    version
        .trim()
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| format!("invalid version '{}'", version))
        })
        .collect()
}

/// Numeric component-wise comparison (`major.minor.patch`). When one
/// version is a prefix of the other, the shorter one orders lower, so
/// `1.0 < 1.0.0`.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, String> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

/// Fails with a descriptive message when `client` falls outside the
/// optional `[min, max]` range.
pub fn check_client_version(
    client: &str,
    min: Option<&str>,
    max: Option<&str>,
) -> Result<(), String> {
    if let Some(min) = min {
        if compare_versions(client, min)? == Ordering::Less {
            return Err(format!(
                "client version {} is older than the minimum {} required by this model",
                client, min
            ));
        }
    }
    if let Some(max) = max {
        if compare_versions(client, max)? == Ordering::Greater {
            return Err(format!(
                "client version {} is newer than the maximum {} supported by this model",
                client, max
            ));
        }
    }
    Ok(())
}
