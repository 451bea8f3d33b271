use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::commands::batch::BatchConfig;
use crate::connectors::sassie::SassieConfig;
use crate::security::auth::{AuthFlow, Credentials};
use crate::transport::rest::DEFAULT_API_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: String, value: String },
}

/// Read an environment variable, treating blank values as unset.
pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an optional environment variable, falling back to `default` when unset.
pub fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env_var(name) {
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Process-level settings assembled from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub flow: AuthFlow,
    pub api_version: String,
    pub http_timeout: Duration,
    pub batch: BatchConfig,
    pub output_dir: PathBuf,
    pub sassie: Option<SassieConfig>,
    pub trigger_token: Option<String>,
}

impl Settings {
    /// Load settings, checking that every variable the selected flow needs is present.
    ///
    /// Recognised variables:
    /// - `SF_AUTH_FLOW`: `jwt` (default), `password` or `web`
    /// - `SF_CLIENT_ID`, `SF_CLIENT_SECRET`, `SF_USERNAME`, `SF_PASSWORD`, `SF_PRIVATE_KEY_PATH`
    /// - `SF_LOGIN_URL`, `SF_REDIRECT_URI`, `SF_CALLBACK_PORT`, `SF_API_VERSION`
    /// - `HTTP_TIMEOUT_SECS`, `BATCH_SIZE`, `BATCH_DELAY_MS`, `OUTPUT_DIR`
    /// - `SASSIE_API_URL`, `SASSIE_USERNAME`, `SASSIE_PASSWORD`, `SASSIE_UPLOAD_PATH`, `SASSIE_PAYLOAD`
    /// - `TRIGGER_TOKEN` (bearer token for the HTTP trigger endpoints)
    pub fn from_env(flow_override: Option<AuthFlow>) -> Result<Self, ConfigError> {
        let flow = match flow_override {
            Some(flow) => flow,
            None => parse_env("SF_AUTH_FLOW", AuthFlow::JwtBearer)?,
        };
        let credentials = Credentials::from_env()?;

        let missing: Vec<String> = credentials
            .missing_for(flow)
            .into_iter()
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let settings = Self {
            credentials,
            flow,
            api_version: env_var("SF_API_VERSION").unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            http_timeout: Duration::from_secs(parse_env("HTTP_TIMEOUT_SECS", 30u64)?),
            batch: BatchConfig::from_env()?,
            output_dir: PathBuf::from(env_var("OUTPUT_DIR").unwrap_or_else(|| "output".to_string())),
            sassie: SassieConfig::from_env()?,
            trigger_token: env_var("TRIGGER_TOKEN"),
        };

        debug!(
            flow = %settings.flow,
            api_version = %settings.api_version,
            batch_size = settings.batch.size,
            output_dir = %settings.output_dir.display(),
            sassie = settings.sassie.is_some(),
            "settings loaded"
        );
        Ok(settings)
    }
}
