use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use captive_portal::{
    access_point::{AccessPointController, Restore},
    backend::{NetworkBackend, NmcliBackend},
    config::{self, PortalConfig},
    gateway::PortalGateway,
    server::{self, PortalState},
    supervisor::{Supervisor, SupervisorState},
};

#[derive(Parser)]
#[command(name = "captive-portal")]
#[command(about = "Keep a wireless device reachable: captive portal AP with automatic client-mode recovery")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connectivity supervisor and the portal web server
    Serve {
        /// Port for the portal HTTP server (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Scan for nearby Wi-Fi networks
    Scan,

    /// Show the active connection
    Status,

    /// Connect to a Wi-Fi network
    Connect {
        /// SSID of the network to connect to
        ssid: String,

        /// Password for the network (open network if omitted)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Disconnect from a network
    Disconnect {
        /// Name of the connection to take down
        ssid: String,
    },

    /// List saved network profiles (excluding the portal's own AP)
    Profiles,

    /// Apply the access point DNS/DHCP/firewall configuration
    ApplyAp,

    /// Restore the pre-portal DNS/firewall configuration
    RestoreAp,

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = PortalConfig::load()?;

    match cli.command {
        Commands::Serve { port } => cmd_serve(config, port).await,
        Commands::Scan => cmd_scan(&config),
        Commands::Status => cmd_status(&config),
        Commands::Connect { ssid, password } => cmd_connect(&config, &ssid, password.as_deref()),
        Commands::Disconnect { ssid } => cmd_disconnect(&config, &ssid),
        Commands::Profiles => cmd_profiles(&config),
        Commands::ApplyAp => cmd_apply_ap(config),
        Commands::RestoreAp => cmd_restore_ap(config),
        Commands::ShowConfig => cmd_show_config(&config),
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn cmd_serve(mut config: PortalConfig, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.portal_port = port;
    }

    let backend: Arc<dyn NetworkBackend> = Arc::new(NmcliBackend::new(config.ap_ssid.clone()));
    let controller = Arc::new(AccessPointController::new(config.clone()));
    let state = Arc::new(Mutex::new(SupervisorState::ClientDisconnected));

    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&backend),
        Arc::clone(&controller),
        Arc::clone(&state),
        config.clone(),
    ));
    let gateway = PortalGateway::new(Arc::clone(&backend), controller, state);

    let shutdown = CancellationToken::new();
    let supervisor_task = tokio::spawn(Arc::clone(&supervisor).run(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let portal = Arc::new(PortalState {
        backend,
        gateway,
        config,
    });
    let result = server::run_server(portal, shutdown.clone()).await;

    shutdown.cancel();
    let _ = supervisor_task.await;
    result
}

fn cmd_scan(config: &PortalConfig) -> Result<()> {
    let backend = NmcliBackend::new(config.ap_ssid.clone());
    let networks = backend.scan()?;

    if networks.is_empty() {
        println!("No networks found.");
        return Ok(());
    }

    println!("{:<32} {:>6} {}", "SSID", "SIGNAL", "SECURITY");
    println!("{}", "-".repeat(60));

    for network in networks {
        let security: Vec<String> = network
            .security
            .iter()
            .map(|s| format!("{s:?}").to_uppercase())
            .collect();
        println!(
            "{:<32} {:>4}% {}",
            network.ssid,
            network.signal,
            security.join(" ")
        );
    }

    Ok(())
}

fn cmd_status(config: &PortalConfig) -> Result<()> {
    let backend = NmcliBackend::new(config.ap_ssid.clone());

    match backend.active_connection()? {
        Some(info) => {
            let mode = if info.ssid == config.ap_ssid {
                "access point"
            } else {
                "client"
            };
            println!("Mode:      {}", mode);
            println!("SSID:      {}", info.ssid);
            println!("Device:    {}", info.device);
            println!("IP:        {}", info.ip_address.as_deref().unwrap_or("unknown"));
            match info.signal_strength {
                Some(signal) => println!("Signal:    {signal}%"),
                None => println!("Signal:    unknown"),
            }
        }
        None => println!("Not connected to any network."),
    }

    Ok(())
}

fn cmd_connect(config: &PortalConfig, ssid: &str, password: Option<&str>) -> Result<()> {
    let backend = NmcliBackend::new(config.ap_ssid.clone());
    println!("Connecting to '{}'...", ssid);

    let result = backend.connect(ssid, password);
    if result.success {
        println!("Connected successfully!");
        println!("IP:     {}", result.ip_address.as_deref().unwrap_or("unknown"));
        if let Some(signal) = result.signal_strength {
            println!("Signal: {signal}%");
        }
        Ok(())
    } else {
        bail!(
            "{}",
            result
                .failure_reason
                .map(|r| r.user_message())
                .unwrap_or("Failed to connect to the network.")
        );
    }
}

fn cmd_disconnect(config: &PortalConfig, ssid: &str) -> Result<()> {
    let backend = NmcliBackend::new(config.ap_ssid.clone());
    backend.disconnect(ssid)?;
    println!("Disconnected from '{}'.", ssid);
    Ok(())
}

fn cmd_profiles(config: &PortalConfig) -> Result<()> {
    let backend = NmcliBackend::new(config.ap_ssid.clone());
    let profiles = backend.saved_profiles(&[config.ap_ssid.clone()])?;

    if profiles.is_empty() {
        println!("No saved network profiles.");
    } else {
        for profile in profiles {
            println!("{profile}");
        }
    }

    Ok(())
}

fn cmd_apply_ap(config: PortalConfig) -> Result<()> {
    let controller = AccessPointController::new(config);
    if controller.apply() {
        println!("Access point configuration applied.");
        Ok(())
    } else {
        bail!("Access point provisioning completed with errors (see log).");
    }
}

fn cmd_restore_ap(config: PortalConfig) -> Result<()> {
    let controller = AccessPointController::new(config);
    match controller.restore() {
        Restore::Restored => println!("Pre-portal configuration restored."),
        Restore::NothingToRestore => println!("Nothing to restore."),
    }
    Ok(())
}

fn cmd_show_config(config: &PortalConfig) -> Result<()> {
    println!("Config file: {}", config::config_path().display());
    println!();
    println!("Interface:    {}", config.interface);
    println!("AP SSID:      {}", config.ap_ssid);
    println!(
        "AP pass:      {}",
        "*".repeat(config.ap_passphrase.len().min(12))
    );
    println!("Gateway:      {}", config.gateway_cidr());
    println!(
        "DHCP range:   {} - {}",
        config.dhcp_range_start, config.dhcp_range_end
    );
    println!("Portal port:  {}", config.portal_port);

    Ok(())
}
