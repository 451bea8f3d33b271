//! SASSIE survey API client
//!
//! Hands extracted survey identifiers to the SASSIE import endpoint. The
//! endpoint is undocumented, so the upload path and payload shape are both
//! configurable.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{env_var, parse_env, ConfigError};
use crate::export::csv::{to_csv_string, Row};

pub const DEFAULT_UPLOAD_PATH: &str = "/api/v1/surveys/import";
pub const UPLOAD_FILE_NAME: &str = "survey_ids.csv";

/// Body shape sent to the import endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    #[default]
    Json,
    /// Base64 CSV with a single `surveyId` column.
    Csv,
}

impl FromStr for PayloadFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unknown payload format: {other}")),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Csv => "csv",
        })
    }
}

#[derive(Clone)]
pub struct SassieConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub upload_path: String,
    pub payload: PayloadFormat,
}

impl fmt::Debug for SassieConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SassieConfig")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("upload_path", &self.upload_path)
            .field("payload", &self.payload)
            .finish()
    }
}

impl SassieConfig {
    /// `Ok(None)` when `SASSIE_API_URL` is unset; the hand-off is then skipped.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(api_url) = env_var("SASSIE_API_URL") else {
            return Ok(None);
        };

        let username = env_var("SASSIE_USERNAME");
        let password = env_var("SASSIE_PASSWORD");
        let mut missing = Vec::new();
        if username.is_none() {
            missing.push("SASSIE_USERNAME".to_string());
        }
        if password.is_none() {
            missing.push("SASSIE_PASSWORD".to_string());
        }
        let (Some(username), Some(password)) = (username, password) else {
            return Err(ConfigError::Missing(missing));
        };

        Ok(Some(Self {
            api_url,
            username,
            password,
            upload_path: env_var("SASSIE_UPLOAD_PATH").unwrap_or_else(|| DEFAULT_UPLOAD_PATH.to_string()),
            payload: parse_env("SASSIE_PAYLOAD", PayloadFormat::Json)?,
        }))
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_url.trim_end_matches('/'),
            self.upload_path.trim_start_matches('/')
        )
    }
}

/// What the import endpoint answered.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub status: u16,
    pub accepted: usize,
    pub response: Value,
}

pub struct SassieClient {
    config: SassieConfig,
    client: Client,
}

impl SassieClient {
    pub fn new(config: SassieConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build SASSIE HTTP client")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &SassieConfig {
        &self.config
    }

    fn payload(&self, ids: &[String]) -> Result<Value> {
        match self.config.payload {
            PayloadFormat::Json => Ok(json!({
                "surveyIds": ids,
                "count": ids.len(),
                "source": "salesforce",
            })),
            PayloadFormat::Csv => {
                let rows: Vec<Row> = ids
                    .iter()
                    .map(|id| {
                        let mut row = Row::new();
                        row.insert("surveyId".into(), Value::String(id.clone()));
                        row
                    })
                    .collect();
                let columns = vec!["surveyId".to_string()];
                let csv = to_csv_string(&rows, Some(&columns))?;
                Ok(json!({
                    "fileName": UPLOAD_FILE_NAME,
                    "contentType": "text/csv",
                    "content": general_purpose::STANDARD.encode(csv),
                }))
            }
        }
    }

    /// Upload survey identifiers; any non-2xx answer is an error.
    pub async fn upload_ids(&self, ids: &[String]) -> Result<UploadReceipt> {
        let url = self.config.upload_url();
        tracing::info!(
            url = %url,
            count = ids.len(),
            payload = %self.config.payload,
            "Uploading survey ids to SASSIE"
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&self.payload(ids)?)
            .send()
            .await
            .context("Failed to connect to SASSIE")?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("SASSIE upload failed: {} - {}", status, text);
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        tracing::debug!(status = status.as_u16(), "SASSIE upload accepted");

        Ok(UploadReceipt {
            status: status.as_u16(),
            accepted: ids.len(),
            response: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_env;
    use mockito::{Matcher, Server};

    fn config(url: &str, payload: PayloadFormat) -> SassieConfig {
        SassieConfig {
            api_url: format!("{url}/"),
            username: "svc".into(),
            password: "hunter2".into(),
            upload_path: DEFAULT_UPLOAD_PATH.into(),
            payload,
        }
    }

    fn ids() -> Vec<String> {
        vec!["S-1".to_string(), "S-2".to_string()]
    }

    #[test]
    fn test_from_env_unconfigured_and_partial() {
        let _guard = test_env::lock();
        test_env::clear();
        assert!(SassieConfig::from_env().unwrap().is_none());

        std::env::set_var("SASSIE_API_URL", "https://sassie.example.com");
        std::env::set_var("SASSIE_USERNAME", "svc");
        match SassieConfig::from_env() {
            Err(ConfigError::Missing(names)) => assert_eq!(names, vec!["SASSIE_PASSWORD"]),
            other => panic!("unexpected: {other:?}"),
        }

        std::env::set_var("SASSIE_PASSWORD", "pw");
        std::env::set_var("SASSIE_PAYLOAD", "CSV");
        let config = SassieConfig::from_env().unwrap().unwrap();
        assert_eq!(config.payload, PayloadFormat::Csv);
        assert_eq!(config.upload_url(), "https://sassie.example.com/api/v1/surveys/import");
        assert!(!format!("{config:?}").contains("pw\""));
        test_env::clear();
    }

    #[tokio::test]
    async fn test_upload_json_payload_with_basic_auth() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", DEFAULT_UPLOAD_PATH)
            // base64("svc:hunter2")
            .match_header("authorization", "Basic c3ZjOmh1bnRlcjI=")
            .match_body(Matcher::Json(json!({
                "surveyIds": ["S-1", "S-2"],
                "count": 2,
                "source": "salesforce"
            })))
            .with_status(202)
            .with_body(r#"{"jobId":"J-9"}"#)
            .create_async()
            .await;

        let client = SassieClient::new(config(&server.url(), PayloadFormat::Json), Duration::from_secs(5)).unwrap();
        let receipt = client.upload_ids(&ids()).await.unwrap();

        assert_eq!(receipt.status, 202);
        assert_eq!(receipt.accepted, 2);
        assert_eq!(receipt.response["jobId"], "J-9");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_csv_payload_is_base64() {
        let mut server = Server::new_async().await;
        let encoded = general_purpose::STANDARD.encode("surveyId\nS-1\nS-2\n");
        let mock = server
            .mock("POST", DEFAULT_UPLOAD_PATH)
            .match_body(Matcher::Json(json!({
                "fileName": UPLOAD_FILE_NAME,
                "contentType": "text/csv",
                "content": encoded
            })))
            .with_status(200)
            .create_async()
            .await;

        let client = SassieClient::new(config(&server.url(), PayloadFormat::Csv), Duration::from_secs(5)).unwrap();
        let receipt = client.upload_ids(&ids()).await.unwrap();

        assert_eq!(receipt.response, Value::Null);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", DEFAULT_UPLOAD_PATH)
            .with_status(401)
            .with_body("bad credentials")
            .create_async()
            .await;

        let client = SassieClient::new(config(&server.url(), PayloadFormat::Json), Duration::from_secs(5)).unwrap();
        let err = client.upload_ids(&ids()).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
