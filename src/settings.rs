//! Process-level settings from environment variables.
//!
//! Workflow documents are always explicit file or API inputs; only the
//! server bind address and similar process concerns come from the
//! environment (with `.env` support).

use crate::error::ConfigError;

/// Settings for the `foreman` process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
}

/// REST API server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Settings {
    /// Load settings from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerSettings {
                host: optional_env("FOREMAN_HOST")?.unwrap_or_else(|| "127.0.0.1".to_string()),
                port: optional_env("FOREMAN_PORT")?
                    .map(|s| s.parse())
                    .transpose()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "FOREMAN_PORT".to_string(),
                        message: format!("must be a port number: {e}"),
                    })?
                    .unwrap_or(8080),
            },
        })
    }
}

fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid unicode".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        // Note: relies on the test environment not defining FOREMAN_* vars.
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
    }
}
