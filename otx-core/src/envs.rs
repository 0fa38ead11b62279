/// Env var overriding how many consecutive failures a delivery tolerates
pub const OTX_SESSION_FAILURE_LIMIT_ENV: &str = "OTX_SESSION_FAILURE_LIMIT";

/// Env var overriding how many available numbers are kept back from
/// allocations that do not close an existing box item
pub const OTX_SESSION_NUMBER_RESERVE_ENV: &str = "OTX_SESSION_NUMBER_RESERVE";

/// Env var disabling persistence of session state (tests, throwaway sessions)
pub const OTX_SESSION_DISABLE_PERSIST_ENV: &str = "OTX_SESSION_DISABLE_PERSIST";

/// Check if env variable is set and not equal `0` or `false` which are common
/// ways to disable something.
pub fn is_env_var_set(var: &str) -> bool {
    std::env::var_os(var).is_some_and(|v| v != "0" && v != "false")
}
