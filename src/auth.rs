use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::CredentialStore;
use crate::error::{Error, Result};
use crate::transport::{Request, Transport};

/// Client id the vendor app identifies itself with.
pub const DEFAULT_CLIENT_ID: &str = "moen_mobile_app";

/// Subtracted once from every token lifetime to absorb clock skew.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

/// Lifetime assumed when the vendor reports none and the token is not a JWT.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Longest `expires_in` taken at face value.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 30 * 24 * 60 * 60;

const TOKEN_PATH: &str = "/auth/login";

/// Account credentials and the current token material.
///
/// `password` is only present between configuration and the first
/// successful login; it is never persisted.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
    pub password: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Credentials for first-time configuration: no tokens yet, only a
    /// password to log in with.
    pub fn with_password(client_id: &str, username: &str, password: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            username: username.to_string(),
            password: Some(password.to_string()),
            access_token: String::new(),
            refresh_token: None,
            expires_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn has_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Bearer token for a single request.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub client_id: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub client_id: &'a str,
    pub grant_type: &'static str,
    pub refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<i64>,
}

/// The token endpoint answers either bare or wrapped in `{"token": {...}}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokenEnvelope {
    Wrapped { token: TokenResponse },
    Bare(TokenResponse),
}

impl TokenEnvelope {
    fn into_inner(self) -> TokenResponse {
        match self {
            TokenEnvelope::Wrapped { token } => token,
            TokenEnvelope::Bare(token) => token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// Read the `exp` claim of a JWT without verifying its signature.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}

/// Absolute expiry for a freshly issued token, with the safety margin
/// applied exactly once.
pub fn compute_expiry(
    now: DateTime<Utc>,
    access_token: &str,
    expires_in: Option<i64>,
) -> DateTime<Utc> {
    let lifetime = match expires_in {
        Some(seconds) => seconds,
        None => jwt_expiry(access_token)
            .map(|exp| (exp - now).num_seconds())
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
    };
    now + Duration::seconds(bounded_lifetime(lifetime) - EXPIRY_SAFETY_MARGIN_SECS)
}

/// Negative lifetimes mean already expired. Anything longer than
/// [`MAX_TOKEN_LIFETIME_SECS`] is not trusted and gets the default.
fn bounded_lifetime(seconds: i64) -> i64 {
    if seconds < 0 {
        0
    } else if seconds > MAX_TOKEN_LIFETIME_SECS {
        warn!(
            "Token lifetime of {}s is implausible, assuming {}s",
            seconds, DEFAULT_TOKEN_LIFETIME_SECS
        );
        DEFAULT_TOKEN_LIFETIME_SECS
    } else {
        seconds
    }
}

/// Owns the access-token lifecycle for one account.
///
/// All reads and writes of the credentials go through a single async mutex
/// that stays locked across a refresh, so concurrent callers wait for the
/// in-flight refresh instead of starting their own.
pub struct TokenManager {
    transport: Arc<Transport>,
    clock: Arc<dyn Clock>,
    state: Mutex<Option<Credentials>>,
    store: Option<Arc<dyn CredentialStore>>,
}

impl TokenManager {
    /// A manager with no credentials; call [`login`](Self::login) first.
    pub fn new(transport: Arc<Transport>) -> Self {
        let clock = transport.clock().clone();
        Self {
            transport,
            clock,
            state: Mutex::new(None),
            store: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.state = Mutex::new(Some(credentials));
        self
    }

    /// Seed for first-time configuration: the first token request logs in
    /// with the password, after which the password is dropped.
    pub fn with_password(self, client_id: &str, username: &str, password: &str) -> Self {
        self.with_credentials(Credentials::with_password(client_id, username, password))
    }

    /// Persist every login and refresh through `store`.
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Restore credentials saved by a previous run and keep persisting to
    /// the same store.
    pub fn from_store(transport: Arc<Transport>, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let manager = Self::new(transport);
        let manager = match store.load()? {
            Some(credentials) => {
                debug!("Restored credentials for {}", credentials.username);
                manager.with_credentials(credentials)
            }
            None => manager,
        };
        Ok(manager.with_store(store))
    }

    /// Snapshot of the current credentials, if any.
    pub async fn credentials(&self) -> Option<Credentials> {
        self.state.lock().await.clone()
    }

    /// Log in with a password and install the resulting tokens.
    ///
    /// The returned credentials carry no password.
    pub async fn login(&self, client_id: &str, username: &str, password: &str) -> Result<Credentials> {
        let mut state = self.state.lock().await;

        info!("Logging in as {}", username);
        let response = self.request_login(client_id, username, password).await?;
        let credentials = self.issue(client_id, username, None, response);
        self.install(&mut state, credentials.clone());

        info!("Authentication successful for user: {}", username);
        Ok(credentials)
    }

    /// Return a bearer token that is valid now, refreshing or logging in
    /// if needed.
    pub async fn ensure_valid_token(&self) -> Result<AccessToken> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let current = match state.as_ref() {
            Some(credentials) => credentials.clone(),
            None => return Err(Error::Auth("Not logged in".to_string())),
        };

        if current.has_token() && !current.is_expired(now) {
            return Ok(AccessToken(current.access_token));
        }

        if let Some(refresh_token) = current.refresh_token.as_deref() {
            debug!("Access token expired or missing, refreshing");
            match self.request_refresh(&current.client_id, refresh_token).await {
                Ok(response) => {
                    let credentials = self.issue(
                        &current.client_id,
                        &current.username,
                        current.refresh_token.clone(),
                        response,
                    );
                    info!("Successfully refreshed access token");
                    return Ok(self.install(&mut state, credentials));
                }
                Err(e) if e.is_auth() => warn!("Refresh token rejected: {}", e),
                Err(e) => return Err(e),
            }
        }

        if let Some(password) = current.password.as_deref() {
            debug!("No usable refresh token, logging in with password");
            let response = self
                .request_login(&current.client_id, &current.username, password)
                .await?;
            let credentials = self.issue(&current.client_id, &current.username, None, response);
            info!("Authentication successful for user: {}", current.username);
            return Ok(self.install(&mut state, credentials));
        }

        *state = None;
        self.clear_store();
        Err(Error::Auth(format!(
            "Session for {} expired and could not be refreshed; re-authentication required",
            current.username
        )))
    }

    /// Mark `token` as expired after the cloud rejected it, unless a newer
    /// token has already replaced it.
    pub async fn invalidate(&self, token: &AccessToken) {
        let mut state = self.state.lock().await;
        if let Some(credentials) = state.as_mut() {
            if credentials.access_token == token.0 {
                debug!("Invalidating rejected access token");
                credentials.expires_at = DateTime::<Utc>::MIN_UTC;
            }
        }
    }

    /// Forget the credentials here and in the store.
    pub async fn logout(&self) {
        let mut state = self.state.lock().await;
        *state = None;
        self.clear_store();
    }

    async fn request_login(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse> {
        let body = serde_json::to_value(LoginRequest {
            client_id,
            username,
            password,
        })
        .map_err(|e| Error::Config(format!("failed to encode login request: {}", e)))?;
        self.request_tokens(body).await
    }

    async fn request_refresh(&self, client_id: &str, refresh_token: &str) -> Result<TokenResponse> {
        let body = serde_json::to_value(RefreshRequest {
            client_id,
            grant_type: "refresh_token",
            refresh_token,
        })
        .map_err(|e| Error::Config(format!("failed to encode refresh request: {}", e)))?;
        self.request_tokens(body).await
    }

    async fn request_tokens(&self, body: serde_json::Value) -> Result<TokenResponse> {
        let response = self.transport.send(&Request::post(TOKEN_PATH, body)).await?;
        let envelope: TokenEnvelope = response.decode("token")?;
        Ok(envelope.into_inner())
    }

    /// Build credentials from a token response. A response without a
    /// refresh token keeps `previous_refresh`.
    fn issue(
        &self,
        client_id: &str,
        username: &str,
        previous_refresh: Option<String>,
        response: TokenResponse,
    ) -> Credentials {
        let now = self.clock.now();
        let expires_at = compute_expiry(now, &response.access_token, response.expires_in);
        Credentials {
            client_id: client_id.to_string(),
            username: username.to_string(),
            password: None,
            refresh_token: response.refresh_token.or(previous_refresh),
            access_token: response.access_token,
            expires_at,
        }
    }

    fn install(&self, state: &mut Option<Credentials>, credentials: Credentials) -> AccessToken {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&credentials) {
                warn!("Failed to persist credentials: {}", e);
            }
        }
        let token = AccessToken(credentials.access_token.clone());
        *state = Some(credentials);
        token
    }

    fn clear_store(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                warn!("Failed to clear stored credentials: {}", e);
            }
        }
    }
}
