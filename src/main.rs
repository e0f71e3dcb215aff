use clap::Parser;
use shelly_meter_emulation::{
    config::Settings,
    device::DeviceIdentity,
    discovery::{DsmrDiscovery, EntityDiscovery},
    home_assistant::HomeAssistantAPI,
    http_server::{self, ShellyRpc},
    meter_cache::MeterCache,
    modbus_server::{self, ShellyModbusService},
    udp_server::{self, UdpHandler},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shelly Pro 3EM emulator fed by a Home Assistant DSMR meter
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    init_logging(&settings, args.verbose);

    info!("Starting Shelly Pro 3EM emulator");
    let device = Arc::new(DeviceIdentity::new(
        &settings.device.device_id,
        &settings.device.device_name,
        &settings.device.mac_address,
    )?);
    info!(
        device_id = device.device_id(),
        mac = device.mac_address(),
        "Device identity"
    );

    let api = Arc::new(HomeAssistantAPI::new(&settings.homeassistant)?);
    info!(url = api.endpoint_url(), "Home Assistant upstream");
    let discovery: Option<Arc<dyn EntityDiscovery>> = if settings.dsmr.auto_discover {
        Some(Arc::new(DsmrDiscovery::new(api.clone())))
    } else {
        None
    };
    let cache = Arc::new(MeterCache::new(
        api,
        settings.dsmr.manual_mapping(),
        discovery,
        Duration::from_secs_f64(settings.homeassistant.poll_interval.max(0.1)),
    ));
    cache.start();

    let shutdown = CancellationToken::new();
    let mut listeners: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let servers = &settings.servers;

    if servers.modbus.enabled {
        // The device answers every unit id
        info!(unit_id = servers.modbus.unit_id, "Modbus unit id configured");
        let listener = modbus_server::bind(&servers.modbus.host, servers.modbus.port).await?;
        let service = ShellyModbusService::new(cache.clone(), device.clone());
        listeners.spawn(modbus_server::serve(listener, service, shutdown.clone()));
    }

    if servers.udp.enabled {
        let sockets = udp_server::bind(&servers.udp.host, &servers.udp.ports).await;
        if sockets.is_empty() {
            warn!("No UDP port could be bound");
        } else {
            let handler = UdpHandler::new(cache.clone(), device.clone());
            let token = shutdown.clone();
            listeners.spawn(async move {
                udp_server::serve(sockets, handler, token).await?;
                Ok(())
            });
        }
    }

    if servers.http.enabled {
        let listener = http_server::bind(&servers.http.host, servers.http.port).await?;
        let rpc = Arc::new(ShellyRpc::new(
            cache.clone(),
            device.clone(),
            &servers.http.host,
            shutdown.clone(),
        ));
        listeners.spawn(http_server::serve(listener, rpc));
    }

    if listeners.is_empty() {
        warn!("All servers are disabled");
    }

    tokio::select! {
        _ = wait_for_signal() => info!("Shutdown requested"),
        Some(res) = listeners.join_next() => match res {
            Ok(Ok(())) => warn!("Server exited unexpectedly"),
            Ok(Err(e)) => error!(error = %e, "Server failed"),
            Err(e) => error!(error = %e, "Server task panicked"),
        },
    }

    shutdown.cancel();
    let drained = tokio::time::timeout(LISTENER_STOP_TIMEOUT, async {
        while let Some(res) = listeners.join_next().await {
            if let Ok(Err(e)) = res {
                warn!(error = %e, "Server stopped with error");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Servers did not stop in time, aborting");
        listeners.abort_all();
    }
    cache.stop().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_logging(settings: &Settings, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.to_lowercase()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
