use std::time::Duration;

use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::security::auth::Session;

pub const DEFAULT_API_VERSION: &str = "v59.0";

#[derive(Debug, Clone, thiserror::Error)]
pub enum RestError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: Value },
    #[error("no response: {0}")]
    NoResponse(String),
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::NoResponse(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default = "default_done")]
    done: bool,
    #[serde(rename = "nextRecordsUrl")]
    next_records_url: Option<String>,
}

fn default_done() -> bool {
    true
}

/// Escape a value for use inside a single-quoted SOQL string literal.
pub fn escape_soql_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// API names (`Account`, `Related_Project__r.Name`) that may be interpolated into SOQL or URLs.
pub fn is_api_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Thin client over the Salesforce REST data endpoints for one session.
#[derive(Debug, Clone)]
pub struct SalesforceClient {
    http: Client,
    session: Session,
    api_version: String,
}

impl SalesforceClient {
    pub fn new(session: Session, api_version: &str, timeout: Duration) -> Result<Self, RestError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RestError::Other(format!("building http client: {e}")))?;

        Ok(Self {
            http,
            session,
            api_version: api_version.to_string(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn instance_url(&self) -> &str {
        self.session.instance_url.trim_end_matches('/')
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/services/data/{}{}", self.instance_url(), self.api_version, path)
    }

    async fn check(resp: Response) -> Result<Response, RestError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Err(RestError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Run a SOQL query, following `nextRecordsUrl` until the result set is exhausted.
    pub async fn query(&self, soql: &str) -> Result<Vec<Value>, RestError> {
        debug!(soql = %soql, "running SOQL query");
        let resp = self
            .http
            .get(self.data_url("/query"))
            .bearer_auth(&self.session.access_token)
            .query(&[("q", soql)])
            .send()
            .await?;
        let mut page: QueryPage = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| RestError::Other(format!("parsing query response: {e}")))?;

        let mut records = std::mem::take(&mut page.records);
        while !page.done {
            let Some(next) = page.next_records_url.take() else {
                break;
            };
            trace!(next = %next, fetched = records.len(), "fetching next query page");
            let resp = self
                .http
                .get(format!("{}{}", self.instance_url(), next))
                .bearer_auth(&self.session.access_token)
                .send()
                .await?;
            page = Self::check(resp)
                .await?
                .json()
                .await
                .map_err(|e| RestError::Other(format!("parsing query page: {e}")))?;
            records.append(&mut page.records);
        }

        debug!(count = records.len(), "query complete");
        Ok(records)
    }

    /// Partially update one record; returns the HTTP status on success.
    pub async fn update(
        &self,
        object_type: &str,
        record_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<u16, RestError> {
        let url = self.data_url(&format!("/sobjects/{object_type}/{record_id}"));
        trace!(url = %url, fields = fields.len(), "sending PATCH");
        let resp = self
            .http
            .patch(&url)
            .bearer_auth(&self.session.access_token)
            .json(fields)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.status().as_u16())
    }

    /// Cheap authenticated request used to revalidate a cached session.
    pub async fn probe(&self) -> Result<(), RestError> {
        let resp = self
            .http
            .get(self.data_url("/limits"))
            .bearer_auth(&self.session.access_token)
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }
}
