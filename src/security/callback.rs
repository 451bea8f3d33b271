use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::security::auth::{AuthError, Credentials};

pub const CALLBACK_PATH: &str = "/oauth/callback";

type CodeSender = Arc<Mutex<Option<oneshot::Sender<Result<String, AuthError>>>>>;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Authorize URL the user opens in a browser for the web-server flow.
pub fn authorize_url(credentials: &Credentials) -> Result<Url, AuthError> {
    let base = format!(
        "{}/services/oauth2/authorize",
        credentials.login_url.trim_end_matches('/')
    );
    Url::parse_with_params(
        &base,
        &[
            ("response_type", "code"),
            ("client_id", credentials.client_id.as_str()),
            ("redirect_uri", credentials.redirect_uri.as_str()),
        ],
    )
    .map_err(|e| AuthError::Callback(format!("building authorize url: {e}")))
}

fn params_to_result(params: CallbackParams) -> Result<String, AuthError> {
    match (params.code, params.error) {
        (Some(code), _) if !code.is_empty() => Ok(code),
        (_, Some(error)) => {
            let description = params.error_description.unwrap_or_default();
            Err(AuthError::Callback(format!("{error}: {description}")))
        }
        _ => Err(AuthError::Callback("callback carried no authorization code".into())),
    }
}

async fn handle_callback(
    State(sender): State<CodeSender>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    let result = params_to_result(params);
    let response = match &result {
        Ok(_) => (
            StatusCode::OK,
            Html("<html><body>Authorization complete. You can close this window.</body></html>"),
        ),
        Err(err) => {
            warn!(error = %err, "authorization callback returned an error");
            (
                StatusCode::BAD_REQUEST,
                Html("<html><body>Authorization failed. Check the terminal for details.</body></html>"),
            )
        }
    };

    if let Some(tx) = sender.lock().await.take() {
        let _ = tx.send(result);
    } else {
        debug!("duplicate callback ignored");
    }
    response
}

pub fn callback_router(sender: CodeSender) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(sender)
}

/// Listen on the fixed callback port until the provider redirects back with a code.
pub async fn wait_for_code(port: u16, timeout: Duration) -> Result<String, AuthError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AuthError::Callback(format!("binding {addr}: {e}")))?;
    info!("waiting for OAuth callback on {}", addr);
    wait_on_listener(listener, timeout).await
}

/// Serve the callback route on an already-bound listener; the first request wins.
pub async fn wait_on_listener(listener: TcpListener, timeout: Duration) -> Result<String, AuthError> {
    let (tx, rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = callback_router(Arc::new(Mutex::new(Some(tx))));

    tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .into_future(),
    );

    let outcome = tokio::time::timeout(timeout, rx).await;
    let _ = shutdown_tx.send(());

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AuthError::Callback("callback listener closed".into())),
        Err(_) => Err(AuthError::Callback(format!(
            "no callback received within {}s",
            timeout.as_secs()
        ))),
    }
}
