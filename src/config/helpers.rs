//! Environment variable parsing shared by the config sections.
//!
//! Every helper reads through an explicit lookup function so that tests can
//! resolve a config from a plain map instead of mutating the process
//! environment.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::ConfigError;

/// Lookup function over an environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Reads the real process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Non-empty, trimmed value of `key`, if set.
pub(crate) fn optional_env(env: EnvLookup<'_>, key: &str) -> Result<Option<String>, ConfigError> {
    Ok(env(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

pub(crate) fn parse_string_env(
    env: EnvLookup<'_>,
    key: &str,
    default: &str,
) -> Result<String, ConfigError> {
    Ok(optional_env(env, key)?.unwrap_or_else(|| default.to_string()))
}

pub(crate) fn parse_bool_env(env: EnvLookup<'_>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(env, key)? {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{v}'"),
            }),
        },
    }
}

pub(crate) fn parse_optional_env<T>(env: EnvLookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional_env(env, key)? {
        None => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_optional_env_treats_blank_as_unset() {
        let lookup = env(&[("A", "  "), ("B", " x ")]);
        assert_eq!(optional_env(&lookup, "A").unwrap(), None);
        assert_eq!(optional_env(&lookup, "B").unwrap(), Some("x".to_string()));
        assert_eq!(optional_env(&lookup, "C").unwrap(), None);
    }

    #[test]
    fn test_parse_bool_env() {
        let lookup = env(&[("T", "YES"), ("F", "0"), ("BAD", "maybe")]);
        assert!(parse_bool_env(&lookup, "T", false).unwrap());
        assert!(!parse_bool_env(&lookup, "F", true).unwrap());
        assert!(parse_bool_env(&lookup, "UNSET", true).unwrap());
        assert!(parse_bool_env(&lookup, "BAD", true).is_err());
    }

    #[test]
    fn test_parse_optional_env() {
        let lookup = env(&[("N", "42"), ("BAD", "forty")]);
        assert_eq!(parse_optional_env(&lookup, "N", 7u32).unwrap(), 42);
        assert_eq!(parse_optional_env(&lookup, "UNSET", 7u32).unwrap(), 7);
        match parse_optional_env(&lookup, "BAD", 7u32) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "BAD"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }
}
