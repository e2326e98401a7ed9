//! ==============================================================================
//! main.rs - gateway entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the collaborators (mesh transport, wifi driver, sensor bank,
//!     status pins) into a SubsystemManager, brings up the subsystems the
//!     configured mode needs at boot, and runs until ctrl+c.
//!
//! responsibilities:
//!     - load configuration (first argument, else config/gateway.toml)
//!     - initialize tracing (RUST_LOG wins over [logging].level)
//!     - drive the boot indicator pin
//!     - start the alternation scheduler (alternating mode)
//!     - serve the diagnostics api when [status].enabled
//!     - disable every subsystem on shutdown
//!
//! ==============================================================================

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use meshlink_gateway::config::{GatewayConfig, GatewayMode};
use meshlink_gateway::hal;
use meshlink_gateway::manager::SubsystemManager;
use meshlink_gateway::mesh::UdpMeshStack;
use meshlink_gateway::scheduler::AlternationScheduler;
use meshlink_gateway::sensors::SimulatedSensors;
use meshlink_gateway::status::{self, StatusState};
use meshlink_gateway::wifi::SimulatedWifi;

/// reads the simulated bank returns zeros for after power-up
const SENSOR_WARMUP_READS: u32 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    // the level lives in the config, so the config is read before logging is up
    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load(&path)?,
        None => GatewayConfig::load_or_default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    tracing::info!("meshlink gateway v{}", env!("CARGO_PKG_VERSION"));
    config.print_summary();

    // step 1: status pins
    let indicators = hal::default_indicators()?;
    let boot_pin = config.indicators.boot_pin;
    indicators.set_gpio_mode(boot_pin, "output")?;
    indicators.write_gpio(boot_pin, true)?;

    // step 2: collaborators
    let mesh = Arc::new(UdpMeshStack::new(&config.mesh));
    let wifi = Arc::new(SimulatedWifi::new(&config.wifi));
    let bank = Arc::new(SimulatedSensors::new(SENSOR_WARMUP_READS));
    let mode = config.gateway.mode;
    let status_cfg = config.status.clone();

    let manager = Arc::new(SubsystemManager::new(config, mesh, wifi, bank, indicators.clone())?);

    // step 3: diagnostics api
    if status_cfg.enabled {
        let state = StatusState::from_manager(&*manager);
        tokio::spawn(async move {
            if let Err(e) = status::run_server(state, &status_cfg.bind).await {
                tracing::error!(error = %e, "diagnostics api stopped");
            }
        });
    }

    // step 4: boot-time subsystems and the alternation timer
    manager.start_mode().await;
    let scheduler = match mode {
        GatewayMode::Alternating => {
            let scheduler = Arc::new(AlternationScheduler::new(manager.clone()));
            let timer = scheduler.clone().spawn();
            Some((scheduler, timer))
        }
        GatewayMode::WifiOnly => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    // let a cycle in progress finish so it cannot re-enable the mesh afterwards
    let _idle = match &scheduler {
        Some((scheduler, timer)) => {
            timer.abort();
            Some(scheduler.idle().await)
        }
        None => None,
    };
    manager.shutdown_all().await;
    indicators.write_gpio(boot_pin, false)?;
    tracing::info!("gateway stopped");
    Ok(())
}
