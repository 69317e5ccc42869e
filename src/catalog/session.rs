use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::transport::Channel;

use crate::error::{ControllerError, Result};
use crate::proto::idp::authentication_client::AuthenticationClient;
use crate::proto::idp::{LoginRequest, RefreshRequest};

/// Bearer tokens for the current catalog session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
}

pub type SharedSession = Arc<RwLock<Session>>;

/// Owns the identity-provider client and rotates the session tokens that
/// [`crate::catalog::CatalogClient`] attaches to every call.
pub struct SessionManager {
    auth: AuthenticationClient<Channel>,
    session: SharedSession,
}

impl SessionManager {
    pub(crate) fn new(channel: Channel, session: SharedSession) -> Self {
        Self {
            auth: AuthenticationClient::new(channel),
            session,
        }
    }

    /// Exchanges service account credentials for a token pair.
    pub async fn login(&self, account_id: &str, secret: &str) -> Result<()> {
        let response = self
            .auth
            .clone()
            .login(LoginRequest {
                external_id: String::new(),
                password: secret.to_string(),
                service_account_id: account_id.to_string(),
            })
            .await
            .map_err(auth_error)?;
        let tokens = response.into_inner();
        self.store(tokens.access_token, tokens.refresh_token).await;
        tracing::debug!(account_id, "logged in to catalog");
        Ok(())
    }

    /// Trades the refresh token for a fresh pair. Called after a transport
    /// failure, when the access token may have expired mid-flight.
    pub async fn refresh(&self) -> Result<()> {
        let refresh_token = self.session.read().await.refresh_token.clone();
        let response = self
            .auth
            .clone()
            .refresh(RefreshRequest { refresh_token })
            .await
            .map_err(auth_error)?;
        let tokens = response.into_inner();
        self.store(tokens.access_token, tokens.refresh_token).await;
        tracing::debug!("catalog session refreshed");
        Ok(())
    }

    async fn store(&self, access_token: String, refresh_token: String) {
        let mut session = self.session.write().await;
        session.access_token = access_token;
        session.refresh_token = refresh_token;
    }
}

/// The identity provider answers UNAUTHENTICATED for credentials it rejects,
/// which is fatal for the controller. Anything else is connectivity.
fn auth_error(status: tonic::Status) -> ControllerError {
    match status.code() {
        tonic::Code::Unauthenticated
        | tonic::Code::PermissionDenied
        | tonic::Code::InvalidArgument => ControllerError::Auth(status.message().to_string()),
        _ => ControllerError::Transport(status),
    }
}
