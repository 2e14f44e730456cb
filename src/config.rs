use crate::error::ProbeError;

/// Connection settings for the controller, taken from the environment at
/// startup. Missing either variable aborts the agent before any socket is
/// opened.
#[derive(Debug, Clone)]
pub struct VoyagerConfig {
    /// Opaque bearer token presented on every REST and WebSocket request.
    pub token: String,
    /// Controller `host[:port]`.
    pub server: String,
}

impl VoyagerConfig {
    pub fn from_env() -> Result<Self, ProbeError> {
        Ok(Self {
            token: require_env("VOYAGER_PROBE_TOKEN")?,
            server: require_env("VOYAGER_SERVER")?,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ProbeError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ProbeError::ConfigMissing(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_env_present() {
        std::env::set_var("VOYAGER_TEST_PRESENT", "abc123");
        assert_eq!(require_env("VOYAGER_TEST_PRESENT").unwrap(), "abc123");
    }

    #[test]
    fn test_require_env_missing() {
        std::env::remove_var("VOYAGER_TEST_MISSING");
        let err = require_env("VOYAGER_TEST_MISSING").unwrap_err();
        assert!(matches!(err, ProbeError::ConfigMissing("VOYAGER_TEST_MISSING")));
    }

    #[test]
    fn test_require_env_empty_is_missing() {
        std::env::set_var("VOYAGER_TEST_EMPTY", "");
        let err = require_env("VOYAGER_TEST_EMPTY").unwrap_err();
        assert!(matches!(err, ProbeError::ConfigMissing(_)));
    }
}
