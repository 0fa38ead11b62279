use std::env;

use anyhow::Context as _;
use otx_core::envs::{
    OTX_SESSION_DISABLE_PERSIST_ENV, OTX_SESSION_FAILURE_LIMIT_ENV,
    OTX_SESSION_NUMBER_RESERVE_ENV, is_env_var_set,
};
use serde::{Deserialize, Serialize};

/// Tunables of a [`crate::Session`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Failed steps a single delivery tolerates before it is abandoned
    pub failure_limit: u32,
    /// Available numbers kept back from allocations that don't close an
    /// existing box item
    pub number_reserve: usize,
    /// Write the session record after every durable change
    pub persist: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            failure_limit: 3,
            number_reserve: 1,
            persist: true,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `OTX_SESSION_*` env vars
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(limit) = env::var(OTX_SESSION_FAILURE_LIMIT_ENV) {
            config.failure_limit = limit
                .parse()
                .with_context(|| format!("failure parsing env var {OTX_SESSION_FAILURE_LIMIT_ENV}"))?;
        }
        if let Ok(reserve) = env::var(OTX_SESSION_NUMBER_RESERVE_ENV) {
            config.number_reserve = reserve.parse().with_context(|| {
                format!("failure parsing env var {OTX_SESSION_NUMBER_RESERVE_ENV}")
            })?;
        }
        if is_env_var_set(OTX_SESSION_DISABLE_PERSIST_ENV) {
            config.persist = false;
        }
        Ok(config)
    }

    pub fn with_failure_limit(mut self, failure_limit: u32) -> Self {
        self.failure_limit = failure_limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn set_env(key: &str, value: &str) {
        // SAFETY: env tests are serialized and nothing else reads these vars
        unsafe { env::set_var(key, value) }
    }

    fn clear_env() {
        for key in [
            OTX_SESSION_FAILURE_LIMIT_ENV,
            OTX_SESSION_NUMBER_RESERVE_ENV,
            OTX_SESSION_DISABLE_PERSIST_ENV,
        ] {
            // SAFETY: see `set_env`
            unsafe { env::remove_var(key) }
        }
    }

    #[test]
    #[serial]
    fn env_overrides_defaults() {
        clear_env();
        assert_eq!(SessionConfig::from_env().unwrap(), SessionConfig::default());

        set_env(OTX_SESSION_FAILURE_LIMIT_ENV, "7");
        set_env(OTX_SESSION_NUMBER_RESERVE_ENV, "0");
        let config = SessionConfig::from_env().unwrap();
        clear_env();
        assert_eq!(
            config,
            SessionConfig {
                failure_limit: 7,
                number_reserve: 0,
                persist: true,
            }
        );
    }

    #[test]
    #[serial]
    fn malformed_env_values_are_errors() {
        clear_env();
        set_env(OTX_SESSION_FAILURE_LIMIT_ENV, "three");
        let limit = SessionConfig::from_env();
        clear_env();
        set_env(OTX_SESSION_NUMBER_RESERVE_ENV, "-1");
        let reserve = SessionConfig::from_env();
        clear_env();

        let err = limit.unwrap_err();
        assert!(err.to_string().contains(OTX_SESSION_FAILURE_LIMIT_ENV), "{err}");
        assert!(reserve.is_err());
    }

    #[test]
    #[serial]
    fn persistence_flag_needs_a_true_value() {
        clear_env();
        let mut persist = vec![];
        for value in ["0", "false", "1", "yes"] {
            set_env(OTX_SESSION_DISABLE_PERSIST_ENV, value);
            persist.push(SessionConfig::from_env().unwrap().persist);
        }
        clear_env();
        assert_eq!(persist, vec![true, true, false, false]);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"failure_limit": 7}"#).unwrap();
        assert_eq!(config.failure_limit, 7);
        assert_eq!(config.number_reserve, 1);
        assert!(config.persist);
    }
}
