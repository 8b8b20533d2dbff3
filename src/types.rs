use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// `deviceType` of the faucet product line. Accounts also list other
/// vendor products (e.g. FLO water monitors) which are filtered out.
pub const FAUCET_DEVICE_TYPE: &str = "VAK";

pub const MIN_VOLUME_ML: u32 = 50;
pub const MAX_VOLUME_ML: u32 = 2000;

/// Extra vendor fields nobody has mapped yet.
pub type Extra = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default = "default_true")]
    pub preset_volumes: bool,
    #[serde(default = "default_true")]
    pub custom_volume: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            preset_volumes: true,
            custom_volume: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The cloud reports volumes as integers, floats or numeric strings,
/// depending on firmware.
fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(number
        .filter(|n| n.is_finite() && *n >= 0.0)
        .map(|n| n.round() as u32))
}

/// Device ids are strings on newer accounts and plain numbers on older ones.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(
        rename = "clientId",
        alias = "id",
        alias = "deviceId",
        alias = "device_id",
        deserialize_with = "lenient_string"
    )]
    pub device_id: String,
    #[serde(default, rename = "name", alias = "nickname", alias = "displayName")]
    pub display_name: Option<String>,
    #[serde(default, rename = "deviceType")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Records without a `deviceType` are kept: older faucet firmware omits it.
fn is_faucet_type(device_type: Option<&str>) -> bool {
    match device_type {
        Some(device_type) => device_type.eq_ignore_ascii_case(FAUCET_DEVICE_TYPE),
        None => true,
    }
}

impl Device {
    pub fn is_faucet(&self) -> bool {
        is_faucet_type(self.device_type.as_deref())
    }

    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("Moen Faucet {}", self.device_id))
    }
}

/// The device list arrives either as a bare array or wrapped.
///
/// Records stay raw until [`into_faucets`](Self::into_faucets): other
/// products on the account use shapes of their own and must not break the
/// list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DeviceList {
    Bare(Vec<Value>),
    Wrapped {
        #[serde(alias = "body", alias = "things")]
        devices: Vec<Value>,
    },
}

impl DeviceList {
    /// Faucet records, decoded one by one. Other products and faucet
    /// records that fail to decode are skipped.
    pub fn into_faucets(self) -> Vec<Device> {
        let records = match self {
            DeviceList::Bare(records) => records,
            DeviceList::Wrapped { devices } => devices,
        };

        records
            .into_iter()
            .filter_map(|record| {
                let device_type = record.get("deviceType").and_then(Value::as_str);
                if !is_faucet_type(device_type) {
                    debug!("Skipping device of type {:?}", device_type);
                    return None;
                }
                match serde_json::from_value::<Device>(record) {
                    Ok(device) => Some(device),
                    Err(e) => {
                        warn!("Skipping unreadable faucet record: {}", e);
                        None
                    }
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaucetState {
    Idle,
    Dispensing,
    Completed,
    Error,
    #[default]
    Unknown,
}

impl FaucetState {
    /// Interpret the vendor's state or last command string.
    pub fn from_vendor(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "idle" | "stop" | "stopped" | "off" | "ready" => FaucetState::Idle,
            "dispensing" | "run" | "running" | "flowing" | "active" | "on" => {
                FaucetState::Dispensing
            }
            "completed" | "complete" | "done" | "finished" => FaucetState::Completed,
            "error" | "fault" | "failed" => FaucetState::Error,
            _ => FaucetState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TemperatureDefinition {
    #[serde(default, alias = "tempC")]
    pub celsius: Option<f64>,
    #[serde(default, alias = "tempF")]
    pub fahrenheit: Option<f64>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Named temperature presets configured on the faucet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TemperatureSettings {
    #[serde(default, alias = "hottest")]
    pub hot: Option<TemperatureDefinition>,
    #[serde(default)]
    pub warm: Option<TemperatureDefinition>,
    #[serde(default, alias = "coldest")]
    pub cold: Option<TemperatureDefinition>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl TemperatureSettings {
    pub fn is_empty(&self) -> bool {
        self.hot.is_none() && self.warm.is_none() && self.cold.is_none() && self.extra.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeviceStatus {
    #[serde(default, alias = "clientId", alias = "id", alias = "device_id")]
    device_id: Option<String>,
    #[serde(default)]
    connected: Option<bool>,
    #[serde(default)]
    connectivity: Option<String>,
    #[serde(default, alias = "faucetState", alias = "status")]
    state: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(
        default,
        alias = "lastDispenseVolumeMl",
        alias = "last_dispense_volume_ml",
        deserialize_with = "lenient_u32"
    )]
    last_dispense_volume: Option<u32>,
    #[serde(default)]
    temperature_definitions: Option<TemperatureSettings>,
    #[serde(flatten)]
    extra: Extra,
}

/// Polled snapshot of a faucet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawDeviceStatus")]
pub struct DeviceStatus {
    pub device_id: String,
    pub connectivity: Connectivity,
    pub faucet_state: FaucetState,
    pub last_dispense_volume_ml: Option<u32>,
    pub temperatures: Option<TemperatureSettings>,
    pub extra: Extra,
}

impl From<RawDeviceStatus> for DeviceStatus {
    fn from(raw: RawDeviceStatus) -> Self {
        let connectivity = match (raw.connected, raw.connectivity.as_deref()) {
            (Some(true), _) => Connectivity::Online,
            (Some(false), _) => Connectivity::Offline,
            (None, Some(value)) => match value.to_ascii_lowercase().as_str() {
                "online" | "connected" => Connectivity::Online,
                "offline" | "disconnected" => Connectivity::Offline,
                _ => Connectivity::Unknown,
            },
            (None, None) => Connectivity::Unknown,
        };

        let faucet_state = raw
            .state
            .as_deref()
            .or(raw.command.as_deref())
            .map(FaucetState::from_vendor)
            .unwrap_or_default();

        Self {
            device_id: raw.device_id.unwrap_or_default(),
            connectivity,
            faucet_state,
            last_dispense_volume_ml: raw.last_dispense_volume,
            temperatures: raw.temperature_definitions,
            extra: raw.extra,
        }
    }
}

/// One side (`reported` or `desired`) of a device shadow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ShadowState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(
        default,
        rename = "lastDispenseVolume",
        alias = "volume",
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_dispense_volume_ml: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Value>,
    #[serde(
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub flow_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_definitions: Option<TemperatureSettings>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Default, Deserialize)]
struct ShadowDocument {
    #[serde(default)]
    reported: ShadowState,
    #[serde(default)]
    desired: Option<ShadowState>,
}

#[derive(Debug, Deserialize)]
struct RawShadow {
    #[serde(default)]
    state: ShadowDocument,
    #[serde(default)]
    version: Option<u64>,
    #[serde(flatten)]
    extra: Extra,
}

/// The vendor's last-known reported state and configuration of a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawShadow")]
pub struct Shadow {
    pub reported: ShadowState,
    pub desired: Option<ShadowState>,
    pub version: Option<u64>,
    pub extra: Extra,
}

impl From<RawShadow> for Shadow {
    fn from(raw: RawShadow) -> Self {
        Self {
            reported: raw.state.reported,
            desired: raw.state.desired,
            version: raw.version,
            extra: raw.extra,
        }
    }
}

impl Shadow {
    pub fn faucet_state(&self) -> FaucetState {
        self.reported
            .command
            .as_deref()
            .map(FaucetState::from_vendor)
            .unwrap_or_default()
    }

    pub fn connectivity(&self) -> Connectivity {
        match self.reported.connected {
            Some(true) => Connectivity::Online,
            Some(false) => Connectivity::Offline,
            None => Connectivity::Unknown,
        }
    }

    /// Temperature presets, preferring what the device reported.
    pub fn temperature_definitions(&self) -> Option<&TemperatureSettings> {
        self.reported.temperature_definitions.as_ref().or_else(|| {
            self.desired
                .as_ref()
                .and_then(|desired| desired.temperature_definitions.as_ref())
        })
    }
}

/// Time window for usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageRange {
    Day,
    Week,
    Month,
    Between(NaiveDate, NaiveDate),
}

impl UsageRange {
    /// Value of the `range` query parameter.
    pub fn as_query(&self) -> String {
        match self {
            UsageRange::Day => "day".to_string(),
            UsageRange::Week => "week".to_string(),
            UsageRange::Month => "month".to_string(),
            UsageRange::Between(start, end) => {
                format!("{}/{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
            }
        }
    }
}

impl std::str::FromStr for UsageRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(UsageRange::Day),
            "week" | "weekly" => Ok(UsageRange::Week),
            "month" | "monthly" => Ok(UsageRange::Month),
            other => {
                let (start, end) = other
                    .split_once('/')
                    .ok_or_else(|| format!("invalid usage range: {}", s))?;
                let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")
                    .map_err(|e| format!("invalid start date {}: {}", start, e))?;
                let end = NaiveDate::parse_from_str(end, "%Y-%m-%d")
                    .map_err(|e| format!("invalid end date {}: {}", end, e))?;
                if end < start {
                    return Err(format!("usage range ends before it starts: {}", s));
                }
                Ok(UsageRange::Between(start, end))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    #[serde(default, alias = "timestamp", alias = "day")]
    pub date: Option<String>,
    #[serde(default, alias = "volume", alias = "volume_ml")]
    pub volume_ml: Option<f64>,
    #[serde(default, alias = "sessionCount")]
    pub sessions: Option<u32>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUsage {
    Bare(Vec<UsageRecord>),
    Wrapped {
        #[serde(alias = "usage", alias = "data")]
        records: Vec<UsageRecord>,
        #[serde(flatten)]
        extra: Extra,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(from = "RawUsage")]
pub struct UsageRecords {
    pub records: Vec<UsageRecord>,
    pub extra: Extra,
}

impl From<RawUsage> for UsageRecords {
    fn from(raw: RawUsage) -> Self {
        match raw {
            RawUsage::Bare(records) => Self {
                records,
                extra: Extra::new(),
            },
            RawUsage::Wrapped { records, extra } => Self { records, extra },
        }
    }
}

impl UsageRecords {
    pub fn total_volume_ml(&self) -> f64 {
        self.records.iter().filter_map(|r| r.volume_ml).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Free-running flow at a temperature and flow rate.
    Start,
    Stop,
    /// Measured volume, stopped by the faucet itself.
    Dispense,
}

/// Requested water temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Temperature {
    Coldest,
    Warm,
    Hottest,
    Celsius(f64),
}

impl Serialize for Temperature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Temperature::Coldest => serializer.serialize_str("coldest"),
            Temperature::Warm => serializer.serialize_str("warm"),
            Temperature::Hottest => serializer.serialize_str("hottest"),
            Temperature::Celsius(value) => serializer.serialize_f64(*value),
        }
    }
}

impl std::str::FromStr for Temperature {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coldest" | "cold" => Ok(Temperature::Coldest),
            "warm" => Ok(Temperature::Warm),
            "hottest" | "hot" => Ok(Temperature::Hottest),
            other => other
                .trim_end_matches('c')
                .parse::<f64>()
                .map(Temperature::Celsius)
                .map_err(|_| format!("invalid temperature: {}", s)),
        }
    }
}

/// A single command for a faucet.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub action: Action,
    pub volume_ml: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub temperature: Option<Temperature>,
    pub flow_rate: Option<u8>,
}

impl Command {
    pub fn dispense(volume_ml: u32, timeout_seconds: u64) -> Self {
        Self {
            action: Action::Dispense,
            volume_ml: Some(volume_ml),
            timeout_seconds: Some(timeout_seconds),
            temperature: None,
            flow_rate: None,
        }
    }

    pub fn start(temperature: Temperature, flow_rate: u8) -> Self {
        Self {
            action: Action::Start,
            volume_ml: None,
            timeout_seconds: None,
            temperature: Some(temperature),
            flow_rate: Some(flow_rate),
        }
    }

    pub fn stop() -> Self {
        Self {
            action: Action::Stop,
            volume_ml: None,
            timeout_seconds: None,
            temperature: None,
            flow_rate: None,
        }
    }

    pub fn payload(&self) -> CommandPayload {
        CommandPayload {
            command_src: "app",
            action: self.action,
            volume_ml: self.volume_ml,
            dispense_active_timeout: self.timeout_seconds,
            temperature: self.temperature,
            flow_rate: self.flow_rate,
        }
    }
}

/// Wire shape of a command. Field names must match the vendor app exactly;
/// the cloud rejects anything else.
#[derive(Debug, Serialize)]
pub struct CommandPayload {
    #[serde(rename = "commandSrc")]
    pub command_src: &'static str,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ml: Option<u32>,
    #[serde(rename = "dispenseActiveTimeout", skip_serializing_if = "Option::is_none")]
    pub dispense_active_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Temperature>,
    #[serde(rename = "flowRate", skip_serializing_if = "Option::is_none")]
    pub flow_rate: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    #[serde(default, alias = "id", alias = "command_id")]
    pub command_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}
