use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::MoenClient;
use crate::clock::{self, Clock};
use crate::error::{Error, Result};
use crate::types::{Command, FaucetState, MAX_VOLUME_ML, MIN_VOLUME_ML};

pub const MIN_TIMEOUT_SECS: u64 = 10;
pub const MAX_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Preset volumes offered by the vendor app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Small,
    Medium,
    Large,
}

impl Preset {
    pub fn volume_ml(self) -> u32 {
        match self {
            Preset::Small => 250,
            Preset::Medium => 500,
            Preset::Large => 750,
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" | "250" => Ok(Preset::Small),
            "medium" | "500" => Ok(Preset::Medium),
            "large" | "750" => Ok(Preset::Large),
            _ => Err(format!("unknown preset: {} (small, medium, large)", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispenseConfig {
    pub poll_interval: Duration,
    /// Consecutive transient poll failures tolerated before giving up.
    pub max_poll_failures: u32,
}

impl Default for DispenseConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_poll_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::TimedOut
                | SessionStatus::Cancelled
                | SessionStatus::Failed
        )
    }
}

/// One volume-limited dispense on one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispenseSession {
    pub id: Uuid,
    pub device_id: String,
    pub target_volume_ml: u32,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub dispensed_volume_ml: Option<u32>,
    pub error: Option<String>,
}

impl DispenseSession {
    fn new(device_id: &str, target_volume_ml: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            target_volume_ml,
            started_at: now,
            deadline: None,
            status: SessionStatus::Pending,
            dispensed_volume_ml: None,
            error: None,
        }
    }

    /// Move to `status`. Terminal states are absorbing: returns false and
    /// leaves the session untouched once one is reached.
    fn transition(&mut self, status: SessionStatus) -> bool {
        if self.status.is_terminal() {
            debug!(
                "Ignoring {:?} for session {} already {:?}",
                status, self.id, self.status
            );
            return false;
        }
        self.status = status;
        true
    }

    fn activate(&mut self, deadline: DateTime<Utc>) {
        if self.transition(SessionStatus::Active) {
            self.deadline = Some(deadline);
        }
    }

    fn complete(&mut self, volume_ml: u32) {
        if self.transition(SessionStatus::Completed) {
            self.dispensed_volume_ml = Some(volume_ml);
        }
    }

    fn fail(&mut self, reason: String) {
        if self.transition(SessionStatus::Failed) {
            self.error = Some(reason);
        }
    }

    /// Append a failed stop to `error`, after whatever ended the session.
    fn record_stop(&mut self, stopped: Result<()>) {
        if let Err(e) = stopped {
            let note = format!("stop failed: {}", e);
            self.error = Some(match self.error.take() {
                Some(reason) => format!("{}; {}", reason, note),
                None => note,
            });
        }
    }
}

struct Entry {
    session: DispenseSession,
    cancel: CancellationToken,
}

type Sessions = Mutex<HashMap<String, Entry>>;

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<String, Entry>> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the device's entry when the session future finishes or is dropped.
struct Release<'a> {
    sessions: &'a Sessions,
    device_id: String,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        lock(self.sessions).remove(&self.device_id);
    }
}

/// Drives dispense sessions: at most one per device, each ending in a
/// terminal state with the faucet told to stop on every abnormal exit.
pub struct DispenseController {
    client: Arc<MoenClient>,
    clock: Arc<dyn Clock>,
    config: DispenseConfig,
    sessions: Sessions,
}

impl DispenseController {
    pub fn new(client: Arc<MoenClient>) -> Self {
        Self::with_config(client, DispenseConfig::default())
    }

    pub fn with_config(client: Arc<MoenClient>, config: DispenseConfig) -> Self {
        let clock = client.clock();
        Self {
            client,
            clock,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<MoenClient> {
        &self.client
    }

    /// Dispense `volume_ml` and wait for the session to end.
    ///
    /// The returned session is always terminal. Validation and conflicts are
    /// reported as errors before anything is sent; failures after that end
    /// up in the session's `status` and `error`.
    pub async fn start(
        &self,
        device_id: &str,
        volume_ml: u32,
        timeout_seconds: u64,
    ) -> Result<DispenseSession> {
        self.start_with_cancel(device_id, volume_ml, timeout_seconds, CancellationToken::new())
            .await
    }

    /// Like [`start`](Self::start), but `cancel` is supplied by the caller.
    /// A token cancelled before the session is registered still ends it as
    /// `Cancelled` without sending the dispense.
    pub async fn start_with_cancel(
        &self,
        device_id: &str,
        volume_ml: u32,
        timeout_seconds: u64,
        cancel: CancellationToken,
    ) -> Result<DispenseSession> {
        validate(volume_ml, timeout_seconds)?;
        crate::client::validate_device_id(device_id)?;

        let session = DispenseSession::new(device_id, volume_ml, self.clock.now());
        {
            let mut sessions = lock(&self.sessions);
            if let Some(existing) = sessions.get(device_id) {
                return Err(Error::Conflict(format!(
                    "device {} already has session {} ({:?})",
                    device_id, existing.session.id, existing.session.status
                )));
            }
            sessions.insert(
                device_id.to_string(),
                Entry {
                    session: session.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        let _release = Release {
            sessions: &self.sessions,
            device_id: device_id.to_string(),
        };

        info!(
            "Starting dispense session {} on {}: {} ml, timeout {}s",
            session.id, device_id, volume_ml, timeout_seconds
        );
        let session = self.run(session, timeout_seconds, cancel).await;
        info!(
            "Dispense session {} on {} ended: {:?}",
            session.id, device_id, session.status
        );
        Ok(session)
    }

    pub async fn start_preset(&self, device_id: &str, preset: Preset) -> Result<DispenseSession> {
        self.start(device_id, preset.volume_ml(), DEFAULT_TIMEOUT_SECS)
            .await
    }

    /// Stop the faucet. A running session is cancelled and sends the stop
    /// itself; otherwise the stop command is sent directly.
    pub async fn stop(&self, device_id: &str) -> Result<()> {
        if self.cancel(device_id) {
            return Ok(());
        }
        info!("Stopping device {}", device_id);
        self.client.stop_water_flow(device_id).await?;
        Ok(())
    }

    /// Signal the device's running session, if any. Returns whether one was
    /// signalled.
    pub fn cancel(&self, device_id: &str) -> bool {
        match lock(&self.sessions).get(device_id) {
            Some(entry) if !entry.session.status.is_terminal() => {
                debug!("Cancelling session {} on {}", entry.session.id, device_id);
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Current state of the device's running session.
    pub fn session(&self, device_id: &str) -> Option<DispenseSession> {
        lock(&self.sessions)
            .get(device_id)
            .map(|entry| entry.session.clone())
    }

    pub fn active_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        devices.sort();
        devices
    }

    async fn run(
        &self,
        mut session: DispenseSession,
        timeout_seconds: u64,
        cancel: CancellationToken,
    ) -> DispenseSession {
        let device_id = session.device_id.clone();

        if cancel.is_cancelled() {
            session.transition(SessionStatus::Cancelled);
            return session;
        }

        let command = Command::dispense(session.target_volume_ml, timeout_seconds);
        match self.client.send_command(&device_id, &command).await {
            Ok(ack) => debug!("Dispense acknowledged: {:?}", ack),
            Err(e) => {
                error!("Failed to start dispense on {}: {}", device_id, e);
                // The command may still have reached the faucet.
                let stopped = self.safety_stop(&device_id).await;
                session.fail(e.to_string());
                session.record_stop(stopped);
                return session;
            }
        }

        let deadline = self.clock.now() + chrono::Duration::seconds(timeout_seconds as i64);
        session.activate(deadline);
        self.publish(&session);

        let mut failures = 0;
        loop {
            let now = self.clock.now();
            if now >= deadline {
                warn!(
                    "Dispense on {} did not complete within {}s, stopping",
                    device_id, timeout_seconds
                );
                let stopped = self.safety_stop(&device_id).await;
                session.transition(SessionStatus::TimedOut);
                session.record_stop(stopped);
                break;
            }

            let wait = self.config.poll_interval.min(clock::until(deadline - now));
            let polled = tokio::select! {
                _ = cancel.cancelled() => None,
                status = async {
                    self.clock.sleep(wait).await;
                    self.client.get_device_status(&device_id).await
                } => Some(status),
            };

            let status = match polled {
                Some(status) => status,
                None => {
                    info!("Dispense on {} cancelled, stopping", device_id);
                    let stopped = self.safety_stop(&device_id).await;
                    session.transition(SessionStatus::Cancelled);
                    session.record_stop(stopped);
                    break;
                }
            };

            match status {
                Ok(status) => {
                    failures = 0;
                    match (status.faucet_state, status.last_dispense_volume_ml) {
                        (FaucetState::Idle | FaucetState::Completed, Some(volume)) => {
                            session.complete(volume);
                            break;
                        }
                        (FaucetState::Error, _) => {
                            error!("Device {} reported an error while dispensing", device_id);
                            let stopped = self.safety_stop(&device_id).await;
                            session.fail("device reported an error".to_string());
                            session.record_stop(stopped);
                            break;
                        }
                        (state, _) => debug!("Device {} is {:?}", device_id, state),
                    }
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= self.config.max_poll_failures {
                        error!(
                            "Lost contact with {} after {} failed polls: {}",
                            device_id, failures, e
                        );
                        let stopped = self.safety_stop(&device_id).await;
                        session.fail(e.to_string());
                        session.record_stop(stopped);
                        break;
                    }
                    warn!(
                        "Status poll for {} failed ({}/{}): {}",
                        device_id, failures, self.config.max_poll_failures, e
                    );
                }
                Err(e) => {
                    error!("Status poll for {} failed: {}", device_id, e);
                    let stopped = self.safety_stop(&device_id).await;
                    session.fail(e.to_string());
                    session.record_stop(stopped);
                    break;
                }
            }
        }

        self.publish(&session);
        session
    }

    /// The session's terminal status does not depend on this; a failure is
    /// only recorded in its `error`.
    async fn safety_stop(&self, device_id: &str) -> Result<()> {
        match self.client.stop_water_flow(device_id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to stop device {}: {}", device_id, e);
                Err(e)
            }
        }
    }

    fn publish(&self, session: &DispenseSession) {
        if let Some(entry) = lock(&self.sessions).get_mut(&session.device_id) {
            entry.session = session.clone();
        }
    }
}

fn validate(volume_ml: u32, timeout_seconds: u64) -> Result<()> {
    if !(MIN_VOLUME_ML..=MAX_VOLUME_ML).contains(&volume_ml) {
        return Err(Error::Validation(format!(
            "volume must be between {} and {} ml, got {}",
            MIN_VOLUME_ML, MAX_VOLUME_ML, volume_ml
        )));
    }
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout_seconds) {
        return Err(Error::Validation(format!(
            "timeout must be between {} and {} seconds, got {}",
            MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS, timeout_seconds
        )));
    }
    Ok(())
}
