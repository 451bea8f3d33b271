use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{env_var, parse_env, ConfigError};
use crate::security::callback;
use crate::security::jwt::JwtAssertion;

pub const DEFAULT_LOGIN_URL: &str = "https://login.salesforce.com";
pub const DEFAULT_CALLBACK_PORT: u16 = 3000;
const TOKEN_PATH: &str = "/services/oauth2/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("network error contacting token endpoint: {0}")]
    Network(String),
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("invalid client: {0}")]
    InvalidClient(String),
    #[error("token endpoint rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("private key error: {0}")]
    Key(String),
    #[error("authorization callback failed: {0}")]
    Callback(String),
}

/// The OAuth2 strategies supported against the Salesforce token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlow {
    Password,
    JwtBearer,
    WebServer,
}

impl FromStr for AuthFlow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "password" => Ok(Self::Password),
            "jwt" | "jwt_bearer" | "jwt-bearer" => Ok(Self::JwtBearer),
            "web" | "web_server" | "web-server" => Ok(Self::WebServer),
            other => Err(format!("unknown auth flow: {other}")),
        }
    }
}

impl fmt::Display for AuthFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Password => "password",
            Self::JwtBearer => "jwt",
            Self::WebServer => "web",
        };
        f.write_str(name)
    }
}

/// Connected-app credentials from environment.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub login_url: String,
    pub redirect_uri: String,
    pub callback_port: u16,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key_path", &self.private_key_path)
            .field("login_url", &self.login_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("callback_port", &self.callback_port)
            .finish()
    }
}

impl Credentials {
    /// Credentials with only a client id and the default endpoints.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            username: None,
            password: None,
            private_key_path: None,
            login_url: DEFAULT_LOGIN_URL.to_string(),
            redirect_uri: default_redirect_uri(DEFAULT_CALLBACK_PORT),
            callback_port: DEFAULT_CALLBACK_PORT,
        }
    }

    /// An unset `SF_CLIENT_ID` leaves `client_id` empty; [`Credentials::missing_for`] reports it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = env_var("SF_CLIENT_ID").unwrap_or_default();
        let callback_port = parse_env("SF_CALLBACK_PORT", DEFAULT_CALLBACK_PORT)?;

        Ok(Self {
            client_id,
            client_secret: env_var("SF_CLIENT_SECRET"),
            username: env_var("SF_USERNAME"),
            password: env_var("SF_PASSWORD"),
            private_key_path: env_var("SF_PRIVATE_KEY_PATH"),
            login_url: env_var("SF_LOGIN_URL").unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            redirect_uri: env_var("SF_REDIRECT_URI")
                .unwrap_or_else(|| default_redirect_uri(callback_port)),
            callback_port,
        })
    }

    /// Names of the environment variables a flow needs but which are unset.
    pub fn missing_for(&self, flow: AuthFlow) -> Vec<&'static str> {
        let mut required = vec![("SF_CLIENT_ID", !self.client_id.trim().is_empty())];
        required.extend(match flow {
            AuthFlow::Password => vec![
                ("SF_USERNAME", self.username.is_some()),
                ("SF_PASSWORD", self.password.is_some()),
            ],
            AuthFlow::JwtBearer => vec![
                ("SF_USERNAME", self.username.is_some()),
                ("SF_PRIVATE_KEY_PATH", self.private_key_path.is_some()),
            ],
            AuthFlow::WebServer => vec![("SF_CLIENT_SECRET", self.client_secret.is_some())],
        });
        required
            .into_iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| name)
            .collect()
    }

    pub(crate) fn token_url(&self) -> String {
        format!("{}{}", self.login_url.trim_end_matches('/'), TOKEN_PATH)
    }
}

fn default_redirect_uri(port: u16) -> String {
    format!("http://localhost:{port}/oauth/callback")
}

/// Bearer token plus the instance it is valid for.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub instance_url: String,
    pub flow: AuthFlow,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"[REDACTED]")
            .field("instance_url", &self.instance_url)
            .field("flow", &self.flow)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

impl Session {
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.issued_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Map a token endpoint error response onto the error taxonomy.
pub(crate) fn classify_token_error(status: u16, body: &str) -> AuthError {
    let parsed: TokenErrorBody = serde_json::from_str(body).unwrap_or_default();
    let description = if parsed.error_description.is_empty() {
        parsed.error.clone()
    } else {
        parsed.error_description.clone()
    };

    match parsed.error.as_str() {
        "invalid_grant" => AuthError::InvalidGrant(description),
        "invalid_client" | "invalid_client_id" | "invalid_client_credentials" => {
            AuthError::InvalidClient(description)
        }
        _ => AuthError::Rejected {
            status,
            body: body.to_string(),
        },
    }
}

type FormParams = Vec<(&'static str, String)>;

/// Exchanges credentials for a [`Session`] using one of the [`AuthFlow`] strategies.
#[derive(Debug, Clone)]
pub struct Authenticator {
    credentials: Credentials,
    http: Client,
    callback_timeout: Duration,
}

impl Authenticator {
    pub fn new(credentials: Credentials) -> Result<Self, AuthError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;

        Ok(Self {
            credentials,
            http,
            callback_timeout: Duration::from_secs(300),
        })
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Obtain a fresh session. No retry is attempted.
    pub async fn obtain_session(&self, flow: AuthFlow) -> Result<Session, AuthError> {
        info!(
            flow = %flow,
            login_url = %self.credentials.login_url,
            "authenticating with Salesforce"
        );

        let params = match flow {
            AuthFlow::Password => self.password_params()?,
            AuthFlow::JwtBearer => self.jwt_params().await?,
            AuthFlow::WebServer => self.authorization_code_params().await?,
        };

        let token = self.exchange(&params).await?;
        info!(flow = %flow, instance_url = %token.instance_url, "authenticated");

        Ok(Session {
            access_token: token.access_token,
            instance_url: token.instance_url,
            flow,
            issued_at: Utc::now(),
        })
    }

    fn password_params(&self) -> Result<FormParams, AuthError> {
        let creds = &self.credentials;
        let username = creds
            .username
            .clone()
            .ok_or(AuthError::MissingCredential("username"))?;
        let password = creds
            .password
            .clone()
            .ok_or(AuthError::MissingCredential("password"))?;

        let mut params = vec![
            ("grant_type", "password".to_string()),
            ("client_id", creds.client_id.clone()),
            ("username", username),
            ("password", password),
        ];
        if let Some(secret) = &creds.client_secret {
            params.push(("client_secret", secret.clone()));
        }
        Ok(params)
    }

    async fn jwt_params(&self) -> Result<FormParams, AuthError> {
        let creds = &self.credentials;
        let subject = creds
            .username
            .as_deref()
            .ok_or(AuthError::MissingCredential("username"))?;
        let key_path = creds
            .private_key_path
            .as_deref()
            .ok_or(AuthError::MissingCredential("private key path"))?;

        let pem = tokio::fs::read(key_path)
            .await
            .map_err(|e| AuthError::Key(format!("reading {key_path}: {e}")))?;

        let assertion = JwtAssertion::new(&creds.client_id, subject, &creds.login_url).sign(&pem)?;
        debug!(subject = %subject, "signed JWT bearer assertion");

        Ok(vec![
            ("grant_type", JWT_BEARER_GRANT.to_string()),
            ("assertion", assertion),
        ])
    }

    async fn authorization_code_params(&self) -> Result<FormParams, AuthError> {
        let creds = &self.credentials;
        let secret = creds
            .client_secret
            .clone()
            .ok_or(AuthError::MissingCredential("client secret"))?;

        let url = callback::authorize_url(creds)?;
        info!(
            authorize_url = %url,
            port = creds.callback_port,
            "open the authorize URL in a browser to continue"
        );
        let code = callback::wait_for_code(creds.callback_port, self.callback_timeout).await?;

        Ok(vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("client_id", creds.client_id.clone()),
            ("client_secret", secret),
            ("redirect_uri", creds.redirect_uri.clone()),
        ])
    }

    async fn exchange(&self, params: &[(&'static str, String)]) -> Result<TokenResponse, AuthError> {
        let url = self.credentials.token_url();
        let resp = self
            .http
            .post(&url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return resp.json::<TokenResponse>().await.map_err(|e| AuthError::Rejected {
                status,
                body: format!("unreadable token response: {e}"),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        let err = classify_token_error(status, &body);
        warn!(status, error = %err, "token request rejected");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn password_credentials(login_url: &str) -> Credentials {
        Credentials {
            client_secret: Some("secret".into()),
            username: Some("api@example.com".into()),
            password: Some("hunter2TOKEN".into()),
            login_url: login_url.to_string(),
            ..Credentials::new("client-123")
        }
    }

    #[test]
    fn test_flow_parsing() {
        assert_eq!("JWT".parse::<AuthFlow>().unwrap(), AuthFlow::JwtBearer);
        assert_eq!("password".parse::<AuthFlow>().unwrap(), AuthFlow::Password);
        assert_eq!("web-server".parse::<AuthFlow>().unwrap(), AuthFlow::WebServer);
        assert!("saml".parse::<AuthFlow>().is_err());
        assert_eq!(AuthFlow::JwtBearer.to_string(), "jwt");
    }

    #[test]
    fn test_missing_for_each_flow() {
        let creds = Credentials::new("client");
        assert_eq!(
            creds.missing_for(AuthFlow::Password),
            vec!["SF_USERNAME", "SF_PASSWORD"]
        );
        assert_eq!(
            creds.missing_for(AuthFlow::JwtBearer),
            vec!["SF_USERNAME", "SF_PRIVATE_KEY_PATH"]
        );
        assert_eq!(creds.missing_for(AuthFlow::WebServer), vec!["SF_CLIENT_SECRET"]);
        assert_eq!(
            Credentials::new("").missing_for(AuthFlow::WebServer),
            vec!["SF_CLIENT_ID", "SF_CLIENT_SECRET"]
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = password_credentials("https://login.example.com");
        let text = format!("{creds:?}");
        assert!(!text.contains("hunter2TOKEN"));
        assert!(!text.contains("\"secret\""));
        assert!(text.contains("[REDACTED]"));
    }

    #[test]
    fn test_classify_token_errors() {
        let grant = classify_token_error(
            400,
            r#"{"error":"invalid_grant","error_description":"authentication failure"}"#,
        );
        assert!(matches!(grant, AuthError::InvalidGrant(ref d) if d == "authentication failure"));

        let client = classify_token_error(400, r#"{"error":"invalid_client_id"}"#);
        assert!(matches!(client, AuthError::InvalidClient(ref d) if d == "invalid_client_id"));

        let other = classify_token_error(503, "Service Unavailable");
        assert!(matches!(other, AuthError::Rejected { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_password_flow_returns_session() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/services/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "password".into()),
                Matcher::UrlEncoded("client_id".into(), "client-123".into()),
                Matcher::UrlEncoded("username".into(), "api@example.com".into()),
                Matcher::UrlEncoded("password".into(), "hunter2TOKEN".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"00Dxx!token","instance_url":"https://acme.my.salesforce.com","token_type":"Bearer"}"#,
            )
            .create_async()
            .await;

        let auth = Authenticator::new(password_credentials(&server.url())).unwrap();
        let session = auth.obtain_session(AuthFlow::Password).await.unwrap();

        assert_eq!(session.access_token, "00Dxx!token");
        assert_eq!(session.instance_url, "https://acme.my.salesforce.com");
        assert_eq!(session.flow, AuthFlow::Password);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_password_flow_invalid_grant() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/services/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"authentication failure"}"#)
            .create_async()
            .await;

        let auth = Authenticator::new(password_credentials(&server.url())).unwrap();
        let err = auth.obtain_session(AuthFlow::Password).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_missing_password_fails_before_network() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/services/oauth2/token")
            .expect(0)
            .create_async()
            .await;

        let creds = Credentials {
            password: None,
            ..password_credentials(&server.url())
        };
        let auth = Authenticator::new(creds).unwrap();
        let err = auth.obtain_session(AuthFlow::Password).await.unwrap_err();

        assert!(matches!(err, AuthError::MissingCredential("password")));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        // Port 9 (discard) is not expected to accept HTTP connections.
        let auth = Authenticator::new(password_credentials("http://127.0.0.1:9")).unwrap();
        let err = auth.obtain_session(AuthFlow::Password).await.unwrap_err();
        assert!(matches!(err, AuthError::Network(_)));
    }

    #[tokio::test]
    async fn test_jwt_flow_posts_signed_assertion() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/services/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), JWT_BEARER_GRANT.into()),
                Matcher::Regex("assertion=[A-Za-z0-9_-]+\\.[A-Za-z0-9_-]+\\.[A-Za-z0-9_-]+".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"jwt-token","instance_url":"https://acme.my.salesforce.com"}"#)
            .create_async()
            .await;

        let key_path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/jwt_test_key.pem");
        let creds = Credentials {
            username: Some("api@example.com".into()),
            private_key_path: Some(key_path.into()),
            login_url: server.url(),
            ..Credentials::new("client-123")
        };

        let auth = Authenticator::new(creds).unwrap();
        let session = auth.obtain_session(AuthFlow::JwtBearer).await.unwrap();
        assert_eq!(session.access_token, "jwt-token");
        assert_eq!(session.flow, AuthFlow::JwtBearer);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_jwt_flow_unreadable_key() {
        let creds = Credentials {
            username: Some("api@example.com".into()),
            private_key_path: Some("/nonexistent/server.key".into()),
            ..Credentials::new("client-123")
        };
        let auth = Authenticator::new(creds).unwrap();
        let err = auth.obtain_session(AuthFlow::JwtBearer).await.unwrap_err();
        assert!(matches!(err, AuthError::Key(_)));
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn web_credentials(login_url: &str, port: u16) -> Credentials {
        Credentials {
            client_secret: Some("secret".into()),
            login_url: login_url.to_string(),
            redirect_uri: default_redirect_uri(port),
            callback_port: port,
            ..Credentials::new("client-123")
        }
    }

    #[tokio::test]
    async fn test_web_server_flow_exchanges_callback_code() {
        let mut server = Server::new_async().await;
        let port = free_port();
        let redirect_uri = default_redirect_uri(port);
        let mock = server
            .mock("POST", "/services/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "abc".into()),
                Matcher::UrlEncoded("client_id".into(), "client-123".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret".into()),
                Matcher::UrlEncoded("redirect_uri".into(), redirect_uri),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"web-token","instance_url":"https://acme.my.salesforce.com"}"#)
            .create_async()
            .await;

        let auth = Authenticator::new(web_credentials(&server.url(), port))
            .unwrap()
            .with_callback_timeout(Duration::from_secs(5));
        let login = tokio::spawn(async move { auth.obtain_session(AuthFlow::WebServer).await });

        // The listener binds asynchronously; retry until it accepts.
        let client = reqwest::Client::new();
        let callback = format!("http://127.0.0.1:{port}/oauth/callback?code=abc");
        let mut delivered = false;
        for _ in 0..100 {
            if let Ok(resp) = client.get(&callback).send().await {
                assert!(resp.status().is_success());
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered, "callback listener never accepted a connection");

        let session = login.await.unwrap().unwrap();
        assert_eq!(session.access_token, "web-token");
        assert_eq!(session.flow, AuthFlow::WebServer);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_web_server_flow_requires_secret_before_listening() {
        // Hold the callback port so any bind attempt would surface as a callback error.
        let held = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        let creds = Credentials {
            client_secret: None,
            ..web_credentials("http://127.0.0.1:9", port)
        };

        let auth = Authenticator::new(creds)
            .unwrap()
            .with_callback_timeout(Duration::from_millis(200));
        let err = auth.obtain_session(AuthFlow::WebServer).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential("client secret")));
        drop(held);
    }
}
