//! services/gateway/src/gateway/session.rs
//!
//! Session exchange: trades a login proof for a backend-issued token and claims,
//! and owns the other explicit session transitions (claim update, sign-out,
//! account deletion).

use crate::error::{GatewayError, GENERIC_FAILURE};
use crate::gateway::credentials::CredentialStore;
use crate::gateway::guest::GuestIdentityService;
use crate::gateway::quota::QuotaGate;
use gateway_core::domain::{AccessToken, AuthSession, ClaimUpdate, LoginProof, Registration};
use gateway_core::ports::{AuthService, PortError};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct SessionExchange {
    auth: Arc<dyn AuthService>,
    credentials: CredentialStore,
    guests: Arc<GuestIdentityService>,
    quota: Arc<QuotaGate>,
}

impl SessionExchange {
    pub fn new(
        auth: Arc<dyn AuthService>,
        credentials: CredentialStore,
        guests: Arc<GuestIdentityService>,
        quota: Arc<QuotaGate>,
    ) -> Self {
        Self {
            auth,
            credentials,
            guests,
            quota,
        }
    }

    /// Exchanges `proof` for a session.
    ///
    /// Fails closed: on any error the user ends up with no session at all.
    pub async fn login(&self, proof: LoginProof) -> Result<AuthSession, GatewayError> {
        let exchanged = match &proof {
            LoginProof::Credentials { email, password } => {
                if email.trim().is_empty() || password.is_empty() {
                    self.credentials.sign_out();
                    return Err(GatewayError::AuthExchange(
                        "Email and password are required".to_string(),
                    ));
                }
                info!("Attempting login for {}", email);
                self.auth.login(email.trim(), password).await.map_err(|e| {
                    error!("Login failed: {}", e);
                    GatewayError::AuthExchange(
                        e.detail().unwrap_or("Invalid email or password").to_string(),
                    )
                })
            }
            LoginProof::IdentityProvider { id_token } => {
                info!("Exchanging identity provider token for a session");
                self.auth
                    .exchange_identity_token(id_token)
                    .await
                    .map_err(|e| {
                        error!("Identity provider exchange failed: {}", e);
                        GatewayError::AuthExchange(GENERIC_FAILURE.to_string())
                    })
            }
        };

        let session = match exchanged {
            Ok(session) if !session.access_token.is_empty() => session,
            Ok(_) => {
                error!("Backend returned a session without an access token");
                self.credentials.sign_out();
                return Err(GatewayError::AuthExchange(GENERIC_FAILURE.to_string()));
            }
            Err(e) => {
                self.credentials.sign_out();
                return Err(e);
            }
        };

        if let Err(e) = self.credentials.establish(session.clone()) {
            error!("Failed to store the new session: {}", e);
            self.credentials.sign_out();
            return Err(GatewayError::AuthExchange(GENERIC_FAILURE.to_string()));
        }

        // Quota no longer applies, so a limit modal left over from guest use goes away.
        self.quota.close_limit_modal();
        // The guest identity is no longer needed once the user is signed in.
        self.guests.clear_session().await;
        Ok(session)
    }

    /// Creates an account. The new account has to log in separately.
    pub async fn register(&self, registration: Registration) -> Result<(), GatewayError> {
        if registration.username.trim().is_empty()
            || registration.email.trim().is_empty()
            || registration.password.is_empty()
        {
            return Err(GatewayError::AuthExchange(
                "Username, email and password are required".to_string(),
            ));
        }
        self.auth.register(&registration).await.map_err(|e| {
            error!("Registration failed: {}", e);
            GatewayError::AuthExchange(e.detail().unwrap_or("Registration failed").to_string())
        })?;
        info!("Registered account for {}", registration.email);
        Ok(())
    }

    /// Merges a claim into the current session without re-authenticating.
    pub fn update_session(&self, update: ClaimUpdate) -> Result<AuthSession, GatewayError> {
        self.credentials.merge_claim(update).map_err(|e| match e {
            PortError::Unauthorized => GatewayError::TokenInvalid,
            other => GatewayError::Port(other),
        })
    }

    pub fn sign_out(&self) {
        self.credentials.sign_out();
    }

    /// Deletes the signed-in account and signs out.
    pub async fn delete_account(&self) -> Result<(), GatewayError> {
        let token = self.require_token()?;
        match self.auth.delete_account(&token).await {
            Ok(()) => {
                info!("Account deleted");
                self.credentials.sign_out();
                Ok(())
            }
            Err(PortError::Unauthorized) => {
                warn!("Account deletion rejected the token, signing out.");
                self.credentials.sign_out();
                Err(GatewayError::TokenInvalid)
            }
            Err(e) => Err(GatewayError::from_transport(e)),
        }
    }

    pub fn current_token(&self) -> Option<AccessToken> {
        self.credentials.current_token()
    }

    fn require_token(&self) -> Result<AccessToken, GatewayError> {
        self.credentials
            .current_token()
            .ok_or(GatewayError::TokenInvalid)
    }
}
