//! Login, token refresh, and logout endpoints.
//!
//! These go straight to the dispatcher: a 401 from the login endpoint means
//! bad credentials and a 401 from the refresh endpoint means the session is
//! over, so neither may loop back into the pipeline's refresh handling.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::dispatch::{Dispatcher, RequestDescriptor};
use super::ApiError;
use crate::auth::{Credential, CredentialStore, RefreshError, SessionTerminator, SessionUser, TokenRefresher};

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    user: SessionUser,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct AuthApi {
    dispatcher: Arc<dyn Dispatcher>,
    store: Arc<CredentialStore>,
    terminator: Arc<SessionTerminator>,
}

impl AuthApi {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, terminator: Arc<SessionTerminator>) -> Self {
        Self {
            dispatcher,
            store: Arc::clone(terminator.store()),
            terminator,
        }
    }

    /// Authenticate and start a session.
    pub async fn login(&self, email: &str, password: &str) -> Result<SessionUser, ApiError> {
        let request = RequestDescriptor::post(LOGIN_PATH).json(&LoginRequest { email, password })?;

        let response = self.dispatcher.send(&request).await?;
        if !response.is_success() {
            return Err(ApiError::from_status(response.status(), response.body()));
        }

        let login: LoginResponse = response.json()?;
        self.store.set_session(
            Credential::new(login.access_token, login.refresh_token),
            login.user.clone(),
        );
        info!(user_id = %login.user.id, role = %login.user.role, "Logged in");
        Ok(login.user)
    }

    /// End the local session, then tell the backend (best effort) using the
    /// token captured beforehand. The local teardown never waits on the network.
    pub async fn logout(&self) {
        let credential = self.store.get();
        self.terminator.terminate();
        info!("Logged out");

        let Some(credential) = credential else {
            return;
        };
        let mut request = RequestDescriptor::post(LOGOUT_PATH);
        if let Err(e) = request.set_bearer(&credential.access_token) {
            warn!(error = %e, "Skipping server-side logout");
            return;
        }
        match self.dispatcher.send(&request).await {
            Ok(response) if response.is_success() => debug!("Server-side logout done"),
            Ok(response) => warn!(status = %response.status(), "Server-side logout rejected"),
            Err(e) => warn!(error = %e, "Server-side logout failed"),
        }
    }
}

#[async_trait]
impl TokenRefresher for AuthApi {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, RefreshError> {
        let request = RequestDescriptor::post(REFRESH_PATH)
            .json(&RefreshRequest { refresh_token })
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        let response = self.dispatcher.send(&request).await?;
        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status().as_u16(),
            });
        }

        let tokens: TokenResponse = response
            .json()
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        Ok(Credential::new(tokens.access_token, tokens.refresh_token))
    }
}
