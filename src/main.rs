use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use notify_rust::Notification;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;

use moen::auth::DEFAULT_CLIENT_ID;
use moen::config::get_config_path;
use moen::dispense::{DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS};
use moen::transport::DEFAULT_BASE_URL;
use moen::types::{Connectivity, FaucetState};
use moen::{
    CredentialStore, DeviceRegistry, DispenseController, DispenseSession, FileCredentialStore,
    MoenClient, Preset, SessionStatus, Temperature, UsageRange,
};

#[derive(Parser)]
#[command(name = "moen")]
#[command(about = "A CLI for controlling Moen smart faucets")]
#[command(version)]
struct Cli {
    /// Base URL of the Moen cloud API
    #[arg(long, env = "MOEN_API_BASE", default_value = DEFAULT_BASE_URL, global = true)]
    base_url: String,

    /// Credentials file (defaults to ~/.moen.yml)
    #[arg(long, env = "MOEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to your Moen account and save the session
    Login {
        /// Email address of the Moen account
        #[arg(long, env = "MOEN_USERNAME")]
        username: Option<String>,
        /// Password (prompted for when omitted)
        #[arg(long, env = "MOEN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long, default_value = DEFAULT_CLIENT_ID)]
        client_id: String,
    },
    /// Forget the saved session
    Logout,
    /// List all faucets connected to the account
    Devices,
    /// Show the current state of a faucet
    Status {
        /// Device id (optional if only one faucet)
        #[arg(long)]
        device: Option<String>,
    },
    /// Dispense a measured volume of water and wait for it to finish
    Dispense {
        /// Device id (optional if only one faucet)
        #[arg(long)]
        device: Option<String>,
        /// Volume in millilitres (50-2000)
        #[arg(long, conflicts_with = "preset")]
        volume: Option<u32>,
        /// small (250ml), medium (500ml) or large (750ml)
        #[arg(long)]
        preset: Option<Preset>,
        /// Seconds to wait before stopping the faucet
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// Turn the water on until stopped
    Start {
        /// Device id (optional if only one faucet)
        #[arg(long)]
        device: Option<String>,
        /// coldest, warm, hottest or degrees Celsius
        #[arg(long, default_value = "warm")]
        temperature: Temperature,
        /// Flow rate in percent (0-100)
        #[arg(long, default_value_t = 100)]
        flow_rate: u8,
    },
    /// Stop the water
    Stop {
        /// Device id (optional if only one faucet)
        #[arg(long)]
        device: Option<String>,
    },
    /// Show water usage
    Usage {
        /// Device id (optional if only one faucet)
        #[arg(long)]
        device: Option<String>,
        /// day, week, month or YYYY-MM-DD/YYYY-MM-DD
        #[arg(long, default_value = "day")]
        range: UsageRange,
    },
}

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Device")]
    device_id: String,
    #[tabled(rename = "Connection")]
    connectivity: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Last dispense")]
    last_dispense: String,
}

#[derive(Tabled)]
struct UsageRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Volume (ml)")]
    volume: String,
    #[tabled(rename = "Sessions")]
    sessions: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => get_config_path()?,
    };
    let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(config_path));

    match cli.command {
        Commands::Login {
            username,
            password,
            client_id,
        } => {
            let username = match username {
                Some(username) => username,
                None => prompt("Email: ")?,
            };
            let password = match password {
                Some(password) => password,
                None => rpassword::prompt_password("Password: ")?,
            };

            let client = MoenClient::new_with_base_url(&cli.base_url)?.with_store(store);
            info!("Authenticating with Moen...");
            client.login(&client_id, &username, &password).await?;
            println!("Logged in as {}.", username);
        }
        Commands::Logout => {
            store.clear()?;
            println!("Logged out.");
        }
        Commands::Devices => {
            let client = Arc::new(logged_in_client(&cli.base_url, store).await?);
            let registry = DeviceRegistry::new(client);
            let snapshots = registry.refresh().await?;

            if snapshots.is_empty() {
                println!("No faucets found for this account.");
                return Ok(());
            }

            let rows: Vec<DeviceRow> = snapshots
                .iter()
                .map(|snapshot| {
                    let status = snapshot.status.as_ref();
                    DeviceRow {
                        name: snapshot.device.name(),
                        device_id: snapshot.device.device_id.clone(),
                        connectivity: status
                            .map(|s| connectivity_display(s.connectivity))
                            .unwrap_or_else(|| "Unavailable".to_string()),
                        state: status
                            .map(|s| state_display(s.faucet_state))
                            .unwrap_or_else(|| "Unknown".to_string()),
                        last_dispense: status
                            .and_then(|s| s.last_dispense_volume_ml)
                            .map(|v| format!("{} ml", v))
                            .unwrap_or_else(|| "-".to_string()),
                    }
                })
                .collect();

            println!("{}", Table::new(&rows));
        }
        Commands::Status { device } => {
            let client = logged_in_client(&cli.base_url, store).await?;
            let device_id = resolve_device(&client, device).await?;
            let status = client.get_device_status(&device_id).await?;

            println!("Device:        {}", device_id);
            println!("Connection:    {}", connectivity_display(status.connectivity));
            println!("State:         {}", state_display(status.faucet_state));
            if let Some(volume) = status.last_dispense_volume_ml {
                println!("Last dispense: {} ml", volume);
            }

            match client.get_temperature_definitions(&device_id).await {
                Ok(temps) if !temps.is_empty() => {
                    let presets = [("Hot", &temps.hot), ("Warm", &temps.warm), ("Cold", &temps.cold)];
                    for (name, def) in presets {
                        if let Some(celsius) = def.as_ref().and_then(|d| d.celsius) {
                            println!("{:<15}{:.1}°C", format!("{}:", name), celsius);
                        }
                    }
                }
                Ok(_) => debug!("No temperature presets reported"),
                Err(e) => warn!("Could not read temperature presets: {}", e),
            }
        }
        Commands::Dispense {
            device,
            volume,
            preset,
            timeout,
        } => {
            if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout) {
                return Err(anyhow::anyhow!(
                    "Timeout must be between {} and {} seconds.",
                    MIN_TIMEOUT_SECS,
                    MAX_TIMEOUT_SECS
                ));
            }
            let volume = match (volume, preset) {
                (Some(volume), _) => volume,
                (None, Some(preset)) => preset.volume_ml(),
                (None, None) => {
                    return Err(anyhow::anyhow!("Specify --volume or --preset."));
                }
            };

            let client = Arc::new(logged_in_client(&cli.base_url, store).await?);
            let device_id = resolve_device(&client, device).await?;
            let controller = Arc::new(DispenseController::new(client));

            let session = dispense_with_progress(controller, &device_id, volume, timeout).await?;
            report_session(&session)?;
        }
        Commands::Start {
            device,
            temperature,
            flow_rate,
        } => {
            let client = logged_in_client(&cli.base_url, store).await?;
            let device_id = resolve_device(&client, device).await?;
            client
                .start_water_flow(&device_id, temperature, flow_rate)
                .await?;
            println!("Water on at {}. Run `moen stop` to turn it off.", device_id);
        }
        Commands::Stop { device } => {
            let client = logged_in_client(&cli.base_url, store).await?;
            let device_id = resolve_device(&client, device).await?;
            client.stop_water_flow(&device_id).await?;
            println!("Water off at {}.", device_id);
        }
        Commands::Usage { device, range } => {
            let client = logged_in_client(&cli.base_url, store).await?;
            let device_id = resolve_device(&client, device).await?;
            let usage = client.get_usage(&device_id, range).await?;

            if usage.records.is_empty() {
                println!("No usage recorded for {}.", range.as_query());
                return Ok(());
            }

            let rows: Vec<UsageRow> = usage
                .records
                .iter()
                .map(|record| UsageRow {
                    date: record.date.clone().unwrap_or_else(|| "-".to_string()),
                    volume: record
                        .volume_ml
                        .map(|v| format!("{:.0}", v))
                        .unwrap_or_else(|| "-".to_string()),
                    sessions: record
                        .sessions
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                })
                .collect();

            println!("{}", Table::new(&rows));
            println!("Total: {:.0} ml", usage.total_volume_ml());
        }
    }

    Ok(())
}

async fn logged_in_client(base_url: &str, store: Arc<dyn CredentialStore>) -> Result<MoenClient> {
    let client = MoenClient::new_with_base_url(base_url)?.restore(store)?;
    if client.tokens().credentials().await.is_none() {
        return Err(anyhow::anyhow!("Not logged in. Run `moen login` first."));
    }
    Ok(client)
}

async fn resolve_device(client: &MoenClient, device: Option<String>) -> Result<String> {
    if let Some(device) = device {
        return Ok(device);
    }

    let devices = client.list_devices().await?;
    match devices.as_slice() {
        [] => Err(anyhow::anyhow!("No faucets found for this account.")),
        [only] => Ok(only.device_id.clone()),
        _ => Err(anyhow::anyhow!(
            "Multiple faucets found. Please specify --device."
        )),
    }
}

/// Run a dispense session behind a spinner. Ctrl-C stops the faucet.
async fn dispense_with_progress(
    controller: Arc<DispenseController>,
    device_id: &str,
    volume: u32,
    timeout: u64,
) -> Result<DispenseSession> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
            .template("{spinner:.blue} {msg}")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Dispensing {} ml...", volume));

    // Cancelling the token also covers a Ctrl-C that lands before the
    // session is registered: the dispense is then never sent.
    let cancel = CancellationToken::new();
    let mut task = {
        let device_id = device_id.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            controller
                .start_with_cancel(&device_id, volume, timeout, cancel)
                .await
        })
    };

    let result = tokio::select! {
        result = &mut task => result,
        _ = tokio::signal::ctrl_c() => {
            spinner.set_message("Stopping...");
            cancel.cancel();
            task.await
        }
    };

    spinner.finish_and_clear();
    Ok(result??)
}

fn report_session(session: &DispenseSession) -> Result<()> {
    match session.status {
        SessionStatus::Completed => {
            let volume = session
                .dispensed_volume_ml
                .unwrap_or(session.target_volume_ml);
            println!("Dispensed {} ml.", volume);

            if let Err(e) = Notification::new()
                .summary("Water ready")
                .body(&format!("Your faucet dispensed {} ml of water.", volume))
                .icon("dialog-information")
                .timeout(5000)
                .show()
            {
                warn!("Failed to send notification: {}", e);
            }
            Ok(())
        }
        SessionStatus::Cancelled => {
            println!("Dispense cancelled; faucet stopped.");
            Ok(())
        }
        SessionStatus::TimedOut => Err(anyhow::anyhow!(
            "Dispense did not finish in time; faucet stopped."
        )),
        _ => Err(anyhow::anyhow!(
            "Dispense failed: {}",
            session.error.as_deref().unwrap_or("unknown error")
        )),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        return Err(anyhow::anyhow!("{} is required.", label.trim_end_matches(": ")));
    }
    Ok(value)
}

fn connectivity_display(connectivity: Connectivity) -> String {
    match connectivity {
        Connectivity::Online => "Online",
        Connectivity::Offline => "Offline",
        Connectivity::Unknown => "Unknown",
    }
    .to_string()
}

fn state_display(state: FaucetState) -> String {
    match state {
        FaucetState::Idle => "Idle",
        FaucetState::Dispensing => "Dispensing",
        FaucetState::Completed => "Completed",
        FaucetState::Error => "Error",
        FaucetState::Unknown => "Unknown",
    }
    .to_string()
}
