//! ==============================================================================
//! manager.rs - the four subsystems and the state they share
//! ==============================================================================
//!
//! purpose:
//!     builds one SubsystemController per subsystem (mesh, wifi, http egress,
//!     sensors) around the collaborators handed in by main.rs or a test, and
//!     owns everything the workers share: the node table, the gateway's own
//!     reading, the rf arbiter and the cloud sender.
//!
//! relationships:
//!     - used by: scheduler.rs, status.rs, main.rs
//!     - uses: subsystem.rs, workers.rs, ingress.rs, egress.rs
//!
//! ==============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{GatewayConfig, GatewayMode};
use crate::domain::SensorReading;
use crate::egress::{CloudEgress, EgressSummary};
use crate::hal::IndicatorProvider;
use crate::ingress::MeshIngress;
use crate::mesh::MeshStack;
use crate::node_table::SharedNodeTable;
use crate::radio::RadioArbiter;
use crate::sensors::SensorBank;
use crate::subsystem::{SubsystemController, SubsystemKind, SubsystemRecord, SubsystemStatus};
use crate::wifi::WifiDriver;
use crate::workers::{HttpEgressWorker, MeshWorker, SensorWorker, WifiWorker};

/// state every worker can reach
#[derive(Clone)]
pub struct SharedState {
    pub config: Arc<GatewayConfig>,
    pub nodes: SharedNodeTable,
    pub own_reading: Arc<RwLock<SensorReading>>,
    pub arbiter: RadioArbiter,
    pub egress: Arc<CloudEgress>,
    identity: Arc<std::sync::RwLock<Option<String>>>,
}

impl SharedState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let own = SensorReading::empty(config.gateway.fallback_address.clone());
        let egress = CloudEgress::new(&config.cloud).context("building cloud client")?;
        Ok(Self {
            egress: Arc::new(egress),
            config: Arc::new(config),
            nodes: SharedNodeTable::new(),
            own_reading: Arc::new(RwLock::new(own)),
            arbiter: RadioArbiter::new(),
            identity: Arc::new(std::sync::RwLock::new(None)),
        })
    }

    /// mesh-local address learned at the last attach, or the fallback
    pub fn identity(&self) -> String {
        self.identity
            .read()
            .ok()
            .and_then(|id| id.clone())
            .unwrap_or_else(|| self.config.gateway.fallback_address.clone())
    }

    pub fn set_identity(&self, address: String) {
        if let Ok(mut id) = self.identity.write() {
            if id.as_deref() != Some(address.as_str()) {
                tracing::info!(address = %address, "gateway mesh address");
                *id = Some(address);
            }
        }
    }

    pub async fn own_reading(&self) -> SensorReading {
        self.own_reading.read().await.clone()
    }

    /// upload own reading plus a snapshot of the table
    pub async fn send_all_now(&self) -> EgressSummary {
        let own = self.own_reading().await;
        let nodes = self.nodes.snapshot().await;
        self.egress.send_all(&own, &nodes).await
    }
}

pub struct SubsystemManager<M: MeshStack, W: WifiDriver, S: SensorBank> {
    pub shared: SharedState,
    pub ingress: Arc<MeshIngress>,
    pub mesh: SubsystemController<MeshWorker<M>>,
    pub wifi: SubsystemController<WifiWorker<W>>,
    pub http: SubsystemController<HttpEgressWorker>,
    pub sensors: SubsystemController<SensorWorker<S>>,
}

impl<M: MeshStack, W: WifiDriver, S: SensorBank> SubsystemManager<M, W, S> {
    pub fn new(
        config: GatewayConfig,
        mesh: Arc<M>,
        wifi: Arc<W>,
        bank: Arc<S>,
        indicators: Arc<dyn IndicatorProvider>,
    ) -> Result<Self> {
        let shared = SharedState::new(config)?;
        let cfg = shared.config.clone();
        let ingress = Arc::new(MeshIngress::new(
            shared.nodes.clone(),
            &cfg.mesh,
            cfg.logging.show_sensor_data,
        ));
        let pins = &cfg.indicators;
        let lifecycle = &cfg.lifecycle;

        Ok(Self {
            mesh: SubsystemController::new(
                SubsystemKind::Mesh,
                MeshWorker::new(mesh, shared.clone(), ingress.clone()),
                lifecycle,
                indicators.clone(),
                pins.mesh_pin,
            ),
            wifi: SubsystemController::new(
                SubsystemKind::Wifi,
                WifiWorker::new(wifi, shared.clone()),
                lifecycle,
                indicators.clone(),
                pins.wifi_pin,
            ),
            http: SubsystemController::new(
                SubsystemKind::HttpEgress,
                HttpEgressWorker::new(shared.clone()),
                lifecycle,
                indicators.clone(),
                pins.http_pin,
            ),
            sensors: SubsystemController::new(
                SubsystemKind::Sensors,
                SensorWorker::new(bank, shared.clone()),
                lifecycle,
                indicators,
                pins.sensors_pin,
            ),
            shared,
            ingress,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    pub fn records(&self) -> Vec<Arc<SubsystemRecord>> {
        vec![
            self.mesh.record(),
            self.wifi.record(),
            self.http.record(),
            self.sensors.record(),
        ]
    }

    pub fn statuses(&self) -> Vec<SubsystemStatus> {
        self.records().iter().map(|r| r.status()).collect()
    }

    /// bring up what the configured mode runs at boot
    pub async fn start_mode(&self) {
        match self.config().gateway.mode {
            GatewayMode::Alternating => {
                tracing::info!("mode: alternating (mesh up, wifi once per cycle)");
                let _ = self.mesh.enable().await;
            }
            GatewayMode::WifiOnly => {
                tracing::info!("mode: wifi only (continuous http sender)");
                let _ = self.wifi.enable().await;
                let _ = self.sensors.enable().await;
                let _ = self.http.enable().await;
            }
        }
    }

    /// disable everything, last-started first
    pub async fn shutdown_all(&self) {
        tracing::info!("stopping all subsystems");
        let _ = self.http.disable().await;
        let _ = self.sensors.disable().await;
        let _ = self.wifi.disable().await;
        let _ = self.mesh.disable().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_falls_back() {
        let shared = SharedState::new(GatewayConfig::default()).unwrap();
        assert_eq!(shared.identity(), "unknown");
        shared.set_identity("fd00::1".to_string());
        assert_eq!(shared.identity(), "fd00::1");
    }

    #[tokio::test]
    async fn test_own_reading_starts_empty() {
        let shared = SharedState::new(GatewayConfig::default()).unwrap();
        let own = shared.own_reading().await;
        assert_eq!(own.address, "unknown");
        assert!(!own.channels.all_nonzero());
    }
}
