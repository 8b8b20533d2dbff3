#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use moen::{Clock, Credentials, MoenClient, Transport, TransportConfig};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::MockServer;

/// Clock whose `sleep` advances time instantly.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        *self.now.lock().unwrap() += chrono::Duration::from_std(duration).unwrap();
        Box::pin(tokio::task::yield_now())
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
}

/// Short backoff so retry tests finish quickly on the real clock.
pub fn test_transport_config() -> TransportConfig {
    TransportConfig {
        timeout: Duration::from_secs(5),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        ..TransportConfig::default()
    }
}

pub fn transport(server: &MockServer, clock: Arc<dyn Clock>) -> Arc<Transport> {
    Arc::new(Transport::with_config(server.uri(), test_transport_config(), clock).unwrap())
}

pub fn logged_in(now: DateTime<Utc>) -> Credentials {
    Credentials {
        client_id: "moen_mobile_app".to_string(),
        username: "test@example.com".to_string(),
        password: None,
        access_token: "access123".to_string(),
        refresh_token: Some("refresh456".to_string()),
        expires_at: now + chrono::Duration::hours(1),
    }
}

pub fn expired(now: DateTime<Utc>) -> Credentials {
    Credentials {
        access_token: "access-old".to_string(),
        expires_at: now - chrono::Duration::minutes(5),
        ..logged_in(now)
    }
}

/// A client already holding a valid token.
pub fn client(server: &MockServer, clock: Arc<dyn Clock>) -> MoenClient {
    let now = clock.now();
    MoenClient::with_transport(transport(server, clock)).with_credentials(logged_in(now))
}

/// A logged-in client over a transport with its own retry settings.
pub fn client_with_config(
    server: &MockServer,
    clock: Arc<dyn Clock>,
    config: TransportConfig,
) -> MoenClient {
    let now = clock.now();
    let transport = Arc::new(Transport::with_config(server.uri(), config, clock).unwrap());
    MoenClient::with_transport(transport).with_credentials(logged_in(now))
}

/// A client with no credentials at all.
pub fn anonymous_client(server: &MockServer, clock: Arc<dyn Clock>) -> MoenClient {
    MoenClient::with_transport(transport(server, clock))
}
