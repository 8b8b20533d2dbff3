pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispense;
pub mod error;
pub mod registry;
pub mod transport;
pub mod types;

pub use auth::{AccessToken, Credentials, TokenManager};
pub use client::MoenClient;
pub use clock::{Clock, SystemClock};
pub use config::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use dispense::{DispenseConfig, DispenseController, DispenseSession, Preset, SessionStatus};
pub use error::{Error, Result};
pub use registry::{DeviceRegistry, DeviceSnapshot};
pub use transport::{RetryPolicy, Transport, TransportConfig};
pub use types::{Command, Device, DeviceStatus, Shadow, Temperature, UsageRange, UsageRecords};
