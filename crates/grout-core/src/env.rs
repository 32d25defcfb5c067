//! Environment variable utilities.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or return the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("GROUT_TEST_UNSET_VAR", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("GROUT_TEST_BOOL_VAR", "yes");
        assert!(env_get_bool("GROUT_TEST_BOOL_VAR", false));
        std::env::remove_var("GROUT_TEST_BOOL_VAR");
        assert!(!env_get_bool("GROUT_TEST_BOOL_VAR", false));
    }
}
