//! Command handlers for the companion CLI

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use companion_ble::{
    CompanionLink, JsonFileSettings, LinkConfig, LinkError, LinkNotice, LoopbackAir, PairedDevice, PairingCode,
    PairingState, PairingStore, PeerAddress, SelfInfo, SystemBackend,
};

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::error::{CliError, Result};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        match cli.command {
            Commands::Scan { seconds } => Self::handle_scan_command(&config, seconds).await,
            Commands::Advertise { name, accept } => Self::handle_advertise_command(&config, name, accept).await,
            Commands::Pair { address } => Self::handle_pair_command(&config, PeerAddress::new(address)).await,
            Commands::Connect => Self::handle_connect_command(&config).await,
            Commands::Forget => Self::handle_forget_command(&config),
            Commands::Status => Self::handle_status_command(&config),
            Commands::Demo => Self::handle_demo_command().await,
        }
    }

    /// Scan and list what was found
    async fn handle_scan_command(config: &CliConfig, seconds: Option<u64>) -> Result<()> {
        let link = open_link(config).await?;
        let duration = seconds
            .map(Duration::from_secs)
            .unwrap_or(link.config().scan_timeout);

        info!("Scanning for {:?}...", duration);
        link.start_scan_for(duration).await?;
        tokio::time::sleep(duration).await;

        let peers = link.discovered_peers();
        if peers.is_empty() {
            println!("No companion devices found");
        } else {
            println!("Discovered devices:");
            for peer in peers {
                println!(
                    "  {}  {:<24} {:>4} dBm  {:?}",
                    peer.address, peer.name, peer.rssi, peer.metadata.device_type
                );
            }
        }

        link.shutdown().await?;
        Ok(())
    }

    /// Advertise until Ctrl+C, answering pairing requests and printing traffic
    async fn handle_advertise_command(config: &CliConfig, name: Option<String>, accept: bool) -> Result<()> {
        let link = open_link(config).await?;
        let name = name.unwrap_or_else(|| config.link.device_name.clone());
        link.start_advertising(SelfInfo::new(name.clone())).await?;
        println!("Advertising as '{}'. Press Ctrl+C to stop.", name);

        let mut pairing = link.watch_pairing();
        let mut notices = link.notices();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,

                changed = pairing.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = pairing.borrow_and_update().clone();
                    match state {
                        PairingState::ConfirmationRequired { code } => {
                            println!("Pairing requested, code {}", code);
                            if accept || confirm("Accept?").await? {
                                link.accept_pairing().await?;
                            } else {
                                link.reject_pairing().await?;
                            }
                        }
                        PairingState::Success => {
                            if let Some(device) = link.paired_device() {
                                println!("Paired with {} ({})", device.name, device.address);
                            }
                        }
                        PairingState::Failed { reason } => println!("Pairing failed: {}", reason),
                        _ => {}
                    }
                }

                notice = notices.recv() => match notice {
                    Ok(notice) => print_notice(&notice),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Skipped {} notices", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        link.shutdown().await?;
        Ok(())
    }

    /// Find a device, show the code and wait for the other side to confirm
    async fn handle_pair_command(config: &CliConfig, address: PeerAddress) -> Result<()> {
        let link = open_link(config).await?;
        let scan_timeout = link.config().scan_timeout;
        link.start_scan().await?;

        let mut discovered = link.watch_discovered();
        let found = wait_until(&mut discovered, scan_timeout, |peers| {
            peers.iter().any(|peer| peer.address == address)
        })
        .await;
        link.stop_scan().await?;
        if found.is_err() {
            link.shutdown().await?;
            return Err(CliError::PeerNotFound(address.to_string()));
        }

        let code = link.initiate_pairing(address.clone()).await?;
        println!("Confirm code {} on {}", code, address);

        let pairing_window = link.config().pairing_timeout + Duration::from_secs(5);
        let mut pairing = link.watch_pairing();
        let outcome = wait_until(&mut pairing, pairing_window, |state| {
            matches!(state, PairingState::Success | PairingState::Failed { .. })
        })
        .await?;

        let result = match outcome {
            PairingState::Success => {
                println!("Paired with {}", address);
                Ok(())
            }
            PairingState::Failed { reason } => Err(CliError::PairingFailed(reason)),
            other => Err(CliError::PairingFailed(format!("unexpected state {:?}", other))),
        };
        link.shutdown().await?;
        result
    }

    /// Reconnect to the paired device
    async fn handle_connect_command(config: &CliConfig) -> Result<()> {
        let link = open_link(config).await?;
        let Some(device) = link.paired_device() else {
            println!("No paired device");
            return Ok(link.shutdown().await?);
        };

        if link.try_auto_connect().await? {
            let mut connected = link.watch_connected();
            let timeout = link.config().connection_timeout;
            wait_until(&mut connected, timeout, |set| set.contains(&device.address)).await?;
            println!("Connected to {} ({})", device.name, device.address);
        } else {
            println!("{} is not nearby or auto-connect is disabled", device.name);
        }

        link.shutdown().await?;
        Ok(())
    }

    fn handle_forget_command(config: &CliConfig) -> Result<()> {
        let store = open_store(config)?;
        match store.load()? {
            Some(device) => {
                store.forget()?;
                println!("Forgot {} ({})", device.name, device.address);
            }
            None => println!("No paired device"),
        }
        Ok(())
    }

    fn handle_status_command(config: &CliConfig) -> Result<()> {
        let store = open_store(config)?;
        let status = json!({
            "deviceName": config.link.device_name,
            "settings": config.settings_path()?,
            "pairedDevice": store.load()?,
            "autoConnect": store.auto_connect()?,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    }

    async fn handle_demo_command() -> Result<()> {
        let report = run_demo().await?;
        println!("Pairing code: {}", report.code);
        if let Some(device) = &report.phone_paired {
            println!("Phone paired with {} ({})", device.name, device.address);
        }
        if let Some(device) = &report.desk_paired {
            println!("Desk paired with {} ({})", device.name, device.address);
        }
        println!("Transferred {} bytes phone -> desk", report.transferred);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn open_store(config: &CliConfig) -> Result<PairingStore> {
    let settings = JsonFileSettings::open(config.settings_path()?)?;
    Ok(PairingStore::new(Arc::new(settings)))
}

async fn open_link(config: &CliConfig) -> Result<CompanionLink> {
    let link_config = config.link_config();
    let store = open_store(config)?;
    let (backend, events) = SystemBackend::new(&link_config).await?;
    Ok(CompanionLink::spawn(link_config, backend, events, store)?)
}

/// Wait for a watched value to satisfy `predicate`
async fn wait_until<T: Clone>(
    rx: &mut watch::Receiver<T>,
    timeout: Duration,
    predicate: impl FnMut(&T) -> bool,
) -> Result<T> {
    match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
        Ok(Ok(value)) => Ok((*value).clone()),
        Ok(Err(_)) => Err(LinkError::Shutdown.into()),
        Err(_) => Err(CliError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out waiting for the link",
        ))),
    }
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn print_notice(notice: &LinkNotice) {
    match notice {
        LinkNotice::PayloadReceived {
            from,
            transfer_id,
            payload,
            complete,
        } => {
            let status = if *complete { "" } else { " (incomplete)" };
            println!("[{}] transfer {}: {} bytes{}", from, transfer_id, payload.len(), status);
        }
        LinkNotice::CommandReceived { from, command, params } => {
            println!("[{}] {} {}", from, command, params);
        }
        LinkNotice::TransferFailed {
            peer,
            transfer_id,
            reason,
        } => println!("[{}] transfer {} failed: {}", peer, transfer_id, reason),
        LinkNotice::Error { message } => println!("error: {}", message),
    }
}

// ----------------------------------------------------------------------------
// Loopback Demo
// ----------------------------------------------------------------------------

const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of [`run_demo`]
#[derive(Debug)]
pub struct DemoReport {
    pub code: PairingCode,
    pub phone_paired: Option<PairedDevice>,
    pub desk_paired: Option<PairedDevice>,
    pub transferred: usize,
}

/// Two simulated devices discover each other, pair and move a payload
pub async fn run_demo() -> Result<DemoReport> {
    let air = LoopbackAir::new();
    let desk_address = PeerAddress::new("C0:FF:EE:00:00:01");
    let phone_address = PeerAddress::new("C0:FF:EE:00:00:02");

    let (desk_radio, desk_events) = air.radio(desk_address.clone(), -45).await;
    let (phone_radio, phone_events) = air.radio(phone_address.clone(), -60).await;
    let desk = CompanionLink::spawn(
        LinkConfig::new().with_device_name("Desk"),
        desk_radio,
        desk_events,
        PairingStore::in_memory(),
    )?;
    let phone = CompanionLink::spawn(
        LinkConfig::new().with_device_name("Phone"),
        phone_radio,
        phone_events,
        PairingStore::in_memory(),
    )?;

    desk.start_advertising(SelfInfo::new("Desk")).await?;
    phone.start_advertising(SelfInfo::new("Phone")).await?;

    phone.start_scan().await?;
    let mut discovered = phone.watch_discovered();
    wait_until(&mut discovered, DEMO_STEP_TIMEOUT, |peers| {
        peers.iter().any(|peer| peer.address == desk_address)
    })
    .await?;
    phone.stop_scan().await?;

    let code = phone.initiate_pairing(desk_address.clone()).await?;
    info!("Phone shows code {}", code);

    let mut desk_pairing = desk.watch_pairing();
    let request = wait_until(&mut desk_pairing, DEMO_STEP_TIMEOUT, |state| {
        matches!(state, PairingState::ConfirmationRequired { .. })
    })
    .await?;
    if request != (PairingState::ConfirmationRequired { code: code.clone() }) {
        return Err(CliError::PairingFailed("codes differ".to_string()));
    }
    desk.accept_pairing().await?;

    let mut phone_pairing = phone.watch_pairing();
    wait_until(&mut phone_pairing, DEMO_STEP_TIMEOUT, |state| *state == PairingState::Success).await?;

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    let mut desk_notices = desk.notices();
    phone
        .send_data(desk_address.clone(), "demo-1", payload.clone())
        .await?;
    let transferred = tokio::time::timeout(DEMO_STEP_TIMEOUT, async {
        loop {
            match desk_notices.recv().await {
                Ok(LinkNotice::PayloadReceived { payload, .. }) => return Ok(payload.len()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(CliError::Link(LinkError::Shutdown)),
            }
        }
    })
    .await
    .map_err(|_| CliError::PairingFailed("payload never arrived".to_string()))??;

    let report = DemoReport {
        code,
        phone_paired: phone.paired_device(),
        desk_paired: desk.paired_device(),
        transferred,
    };
    phone.shutdown().await?;
    desk.shutdown().await?;
    Ok(report)
}
