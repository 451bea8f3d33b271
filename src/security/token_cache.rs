use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::security::auth::{AuthError, AuthFlow, Authenticator, Session};
use crate::security::jwt::ASSERTION_LIFETIME_SECS;
use crate::transport::rest::SalesforceClient;

const DEFAULT_SESSION_LIFETIME_SECS: i64 = 2 * 60 * 60;

/// Caches one session and revalidates it with a probe before reuse.
#[derive(Debug, Clone)]
pub struct SessionCache {
    authenticator: Authenticator,
    flow: AuthFlow,
    api_version: String,
    lifetime: chrono::Duration,
    probe_timeout: Duration,
    session: Arc<RwLock<Option<Session>>>,
    // Held while re-authenticating so concurrent misses share one login.
    refresh: Arc<Mutex<()>>,
}

impl SessionCache {
    pub fn new(authenticator: Authenticator, flow: AuthFlow, api_version: &str) -> Self {
        Self {
            authenticator,
            flow,
            api_version: api_version.to_string(),
            lifetime: Self::lifetime_for(flow),
            probe_timeout: Duration::from_secs(10),
            session: Arc::new(RwLock::new(None)),
            refresh: Arc::new(Mutex::new(())),
        }
    }

    /// JWT sessions are re-minted after the assertion lifetime; other flows live longer.
    pub fn lifetime_for(flow: AuthFlow) -> chrono::Duration {
        match flow {
            AuthFlow::JwtBearer => chrono::Duration::seconds(ASSERTION_LIFETIME_SECS),
            AuthFlow::Password | AuthFlow::WebServer => {
                chrono::Duration::seconds(DEFAULT_SESSION_LIFETIME_SECS)
            }
        }
    }

    pub fn with_lifetime(mut self, lifetime: chrono::Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn flow(&self) -> AuthFlow {
        self.flow
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Return the cached session if still young and accepted by the probe, else re-authenticate.
    ///
    /// Only one caller re-authenticates at a time; callers that queued behind it
    /// take the session it produced. The web-server flow's fixed callback port
    /// depends on this.
    pub async fn session(&self) -> Result<Session, AuthError> {
        let seen = self.session.read().await.clone();
        if let Some(cached) = &seen {
            if self.usable(cached).await {
                debug!(instance_url = %cached.instance_url, "reusing cached session");
                return Ok(cached.clone());
            }
        }

        let _refreshing = self.refresh.lock().await;
        if let Some(current) = self.session.read().await.clone() {
            let replaced = seen.as_ref().map_or(true, |old| {
                old.access_token != current.access_token || old.issued_at != current.issued_at
            });
            if replaced && current.age() < self.lifetime {
                debug!("session refreshed by a concurrent caller");
                return Ok(current);
            }
        }

        let fresh = self.authenticator.obtain_session(self.flow).await?;
        self.swap(fresh.clone()).await;
        Ok(fresh)
    }

    async fn usable(&self, session: &Session) -> bool {
        if session.age() >= self.lifetime {
            debug!(age_secs = session.age().num_seconds(), "cached session expired");
            return false;
        }
        self.probe(session).await
    }

    async fn probe(&self, session: &Session) -> bool {
        let client = match SalesforceClient::new(session.clone(), &self.api_version, self.probe_timeout) {
            Ok(client) => client,
            Err(err) => {
                warn!(error = %err, "could not build probe client");
                return false;
            }
        };
        match client.probe().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "cached session failed probe; re-authenticating");
                false
            }
        }
    }

    /// Replace the cached session.
    pub async fn swap(&self, session: Session) {
        let mut slot = self.session.write().await;
        *slot = Some(session);
        info!(flow = %self.flow, "session cached");
    }

    pub async fn invalidate(&self) {
        self.session.write().await.take();
    }

    pub async fn current(&self) -> Option<Session> {
        self.session.read().await.clone()
    }
}
