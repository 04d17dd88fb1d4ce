// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed readers with defaults and validation for MOCKBOX_* settings

use std::str::FromStr;

/// Parse an environment variable, falling back to `default` when it is unset or unparseable.
pub fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(var_name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse an environment variable and accept it only if `validator` approves.
///
/// Values that are set but fail to parse or validate are reported with a warning so a
/// typo in a deployment does not silently change behaviour.
pub fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    let raw_value = match std::env::var(var_name) {
        Ok(raw) => raw,
        Err(_) => return default,
    };

    match raw_value.trim().parse::<T>() {
        Ok(parsed) if validator(parsed) => parsed,
        Ok(_) => {
            tracing::warn!(
                "Environment variable {} has invalid value '{}', using default: {}",
                var_name,
                raw_value,
                default
            );
            default
        }
        Err(_) => {
            tracing::warn!(
                "Environment variable {} has unparseable value '{}', using default: {}",
                var_name,
                raw_value,
                default
            );
            default
        }
    }
}

/// Read a boolean flag. Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_env_flag(var_name: &str, default: bool) -> bool {
    match std::env::var(var_name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                tracing::warn!(
                    "Environment variable {} has unrecognised flag value '{}', using default: {}",
                    var_name,
                    raw,
                    default
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Read an optional string, treating empty values as unset.
pub fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a comma separated list, dropping empty items.
pub fn env_list(var_name: &str) -> Vec<String> {
    env_string(var_name)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
