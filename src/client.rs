use log::{debug, info, warn};
use std::sync::Arc;

use crate::auth::{AccessToken, Credentials, TokenManager};
use crate::clock::Clock;
use crate::config::CredentialStore;
use crate::error::{Error, Result};
use crate::transport::{
    next_backoff, Request, Response, RetryPolicy, Transport, DEFAULT_BASE_URL,
};
use crate::types::{
    Action, Command, CommandAck, Device, DeviceList, DeviceStatus, Shadow, Temperature,
    TemperatureSettings, UsageRange, UsageRecords, UserProfile, MAX_VOLUME_ML, MIN_VOLUME_ML,
};

pub const MAX_FLOW_RATE: u8 = 100;

/// Typed access to the faucet cloud API.
///
/// Every call except [`login`](Self::login) obtains a bearer token from the
/// [`TokenManager`]. A 401/403 answer invalidates that token and the request
/// is re-sent once with a fresh one.
pub struct MoenClient {
    transport: Arc<Transport>,
    tokens: TokenManager,
}

impl MoenClient {
    pub fn new() -> Result<Self> {
        Self::new_with_base_url(DEFAULT_BASE_URL)
    }

    pub fn new_with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self::with_transport(Arc::new(Transport::new(base_url)?)))
    }

    pub fn with_transport(transport: Arc<Transport>) -> Self {
        let tokens = TokenManager::new(transport.clone());
        Self { transport, tokens }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.tokens = self.tokens.with_credentials(credentials);
        self
    }

    pub fn with_password(mut self, client_id: &str, username: &str, password: &str) -> Self {
        self.tokens = self.tokens.with_password(client_id, username, password);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.tokens = self.tokens.with_store(store);
        self
    }

    /// Pick up credentials saved by a previous run from `store`.
    pub fn restore(self, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let tokens = TokenManager::from_store(self.transport.clone(), store)?;
        Ok(Self {
            transport: self.transport,
            tokens,
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.transport.clock().clone()
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    /// Log in with a password. No prior token is needed.
    pub async fn login(&self, client_id: &str, username: &str, password: &str) -> Result<Credentials> {
        self.tokens.login(client_id, username, password).await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        debug!("Fetching device list");
        let response = self.execute(Request::get("/devices")).await?;
        let list: DeviceList = response.decode("device list")?;

        let devices = list.into_faucets();

        debug!("Found {} faucets", devices.len());
        Ok(devices)
    }

    pub async fn get_device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        validate_device_id(device_id)?;
        debug!("Fetching status for device: {}", device_id);

        let response = self
            .execute(Request::get(format!("/devices/{}/status", device_id)))
            .await?;
        let mut status: DeviceStatus = response.decode("device status")?;
        if status.device_id.is_empty() {
            status.device_id = device_id.to_string();
        }
        Ok(status)
    }

    pub async fn get_device_shadow(&self, device_id: &str) -> Result<Shadow> {
        validate_device_id(device_id)?;
        debug!("Fetching shadow for device: {}", device_id);

        let response = self
            .execute(Request::get(format!("/devices/{}/shadow", device_id)))
            .await?;
        response.decode("device shadow")
    }

    /// Temperature presets from the shadow. Empty when the device reports none.
    pub async fn get_temperature_definitions(&self, device_id: &str) -> Result<TemperatureSettings> {
        let shadow = self.get_device_shadow(device_id).await?;
        match shadow.temperature_definitions() {
            Some(settings) => Ok(settings.clone()),
            None => {
                debug!("Device {} reports no temperature definitions", device_id);
                Ok(TemperatureSettings::default())
            }
        }
    }

    pub async fn get_usage(&self, device_id: &str, range: UsageRange) -> Result<UsageRecords> {
        validate_device_id(device_id)?;
        let range = range.as_query();
        debug!("Fetching usage for device {} ({})", device_id, range);

        let request = Request::get(format!("/devices/{}/usage", device_id)).query("range", range);
        let response = self.execute(request).await?;
        response.decode("usage")
    }

    pub async fn get_user_profile(&self) -> Result<UserProfile> {
        debug!("Fetching user profile");
        let response = self.execute(Request::get("/users/me")).await?;
        response.decode("user profile")
    }

    /// Send a single command. Writes are never retried, except stop.
    pub async fn send_command(&self, device_id: &str, command: &Command) -> Result<CommandAck> {
        validate_device_id(device_id)?;
        validate_command(command)?;

        let body = serde_json::to_value(command.payload())
            .map_err(|e| Error::Validation(format!("failed to encode command: {}", e)))?;
        let retry = match command.action {
            Action::Stop => RetryPolicy::SafetyCritical,
            _ => RetryPolicy::Never,
        };

        info!("Sending {:?} command to device {}", command.action, device_id);
        let request = Request::post(format!("/devices/{}/commands", device_id), body).retry(retry);
        let response = self.execute(request).await?;
        response.decode("command acknowledgement")
    }

    /// Measured dispense; the faucet stops itself at `volume_ml`.
    pub async fn dispense(
        &self,
        device_id: &str,
        volume_ml: u32,
        timeout_seconds: u64,
    ) -> Result<CommandAck> {
        self.send_command(device_id, &Command::dispense(volume_ml, timeout_seconds))
            .await
    }

    /// Free-running flow until [`stop_water_flow`](Self::stop_water_flow).
    pub async fn start_water_flow(
        &self,
        device_id: &str,
        temperature: Temperature,
        flow_rate: u8,
    ) -> Result<CommandAck> {
        self.send_command(device_id, &Command::start(temperature, flow_rate))
            .await
    }

    pub async fn stop_water_flow(&self, device_id: &str) -> Result<CommandAck> {
        self.send_command(device_id, &Command::stop()).await
    }

    async fn execute(&self, request: Request) -> Result<Response> {
        let policy = request.retry_policy();
        let token = self.token_for(policy).await?;

        match self
            .transport
            .send(&request.clone().bearer(token.as_str()))
            .await
        {
            Err(e) if e.is_auth() => {
                warn!("{}; re-authenticating and retrying once", e);
                self.tokens.invalidate(&token).await;
                let token = self.token_for(policy).await?;
                self.transport.send(&request.bearer(token.as_str())).await
            }
            other => other,
        }
    }

    /// A valid bearer token. For safety-critical requests a transient
    /// failure to obtain one is retried with the same budget and backoff
    /// as the request itself, so a stop is not lost to an auth outage.
    async fn token_for(&self, policy: RetryPolicy) -> Result<AccessToken> {
        if policy != RetryPolicy::SafetyCritical {
            return self.tokens.ensure_valid_token().await;
        }

        let config = self.transport.config();
        let attempts = config.attempts_for(policy);
        let mut backoff = config.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.tokens.ensure_valid_token().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "Could not obtain a token (attempt {}/{}): {}; retrying in {:?}",
                        attempt, attempts, e, backoff
                    );
                    self.transport.clock().sleep(backoff).await;
                    backoff = next_backoff(backoff, config.max_backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Device ids are interpolated into URL paths.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("device id must not be empty".to_string()));
    }
    if device_id.contains(['/', '?', '#']) {
        return Err(Error::Validation(format!(
            "device id contains reserved characters: {}",
            device_id
        )));
    }
    Ok(())
}

fn validate_command(command: &Command) -> Result<()> {
    if let Some(volume) = command.volume_ml {
        if !(MIN_VOLUME_ML..=MAX_VOLUME_ML).contains(&volume) {
            return Err(Error::Validation(format!(
                "volume must be between {} and {} ml, got {}",
                MIN_VOLUME_ML, MAX_VOLUME_ML, volume
            )));
        }
    }
    if let Some(flow_rate) = command.flow_rate {
        if flow_rate > MAX_FLOW_RATE {
            return Err(Error::Validation(format!(
                "flow rate must be between 0 and {}, got {}",
                MAX_FLOW_RATE, flow_rate
            )));
        }
    }
    if let Some(Temperature::Celsius(celsius)) = command.temperature {
        if !celsius.is_finite() {
            return Err(Error::Validation("temperature must be a number".to_string()));
        }
    }
    Ok(())
}
