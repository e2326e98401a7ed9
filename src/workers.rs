//! ==============================================================================
//! workers.rs - bodies of the four subsystems
//! ==============================================================================
//!
//! purpose:
//!     - MeshWorker: holds the rf front-end for the mesh, attaches, feeds
//!       inbound datagrams to MeshIngress and periodically publishes the
//!       gateway's own reading to the mesh group.
//!     - WifiWorker: holds the rf front-end for wifi and keeps the station
//!       associated until told to stop.
//!     - HttpEgressWorker: uploads everything every cloud.interval_ms.
//!     - SensorWorker: powers the sensor bank, waits for plausible values and
//!       keeps the gateway's own reading fresh.
//!
//! cleanup:
//!     radio leases and driver attachments are guards held by the worker
//!     future, so they are released even when disable() has to abort it.
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::codec::{self, EnvelopeFlavor};
use crate::domain::{local_timestamp, SensorReading};
use crate::ingress::MeshIngress;
use crate::manager::SharedState;
use crate::mesh::MeshStack;
use crate::radio::Radio;
use crate::sensors::SensorBank;
use crate::subsystem::{SubsystemWorker, WorkerContext};
use crate::wifi::WifiDriver;

/// back-off after a failed receive, so a dead socket does not spin
const RECV_RETRY: Duration = Duration::from_millis(100);

// ==============================================================================
// mesh
// ==============================================================================

pub struct MeshWorker<M: MeshStack> {
    mesh: Arc<M>,
    shared: SharedState,
    ingress: Arc<MeshIngress>,
}

/// stops the mesh stack when dropped
struct Attached<M: MeshStack>(Arc<M>);

impl<M: MeshStack> Drop for Attached<M> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

impl<M: MeshStack> MeshWorker<M> {
    pub fn new(mesh: Arc<M>, shared: SharedState, ingress: Arc<MeshIngress>) -> Self {
        Self { mesh, shared, ingress }
    }

    pub fn stack(&self) -> &Arc<M> {
        &self.mesh
    }

    async fn publish_own(&self) {
        let own = self.shared.own_reading().await;
        let body = codec::encode(&own, EnvelopeFlavor::Relay);
        let resource = &self.shared.config.mesh.resource;
        match self.mesh.send(resource, body.as_bytes()).await {
            Ok(()) => tracing::debug!(bytes = body.len(), "own reading published to mesh"),
            Err(e) => tracing::warn!(error = %e, "mesh publish failed"),
        }
    }
}

impl<M: MeshStack> SubsystemWorker for MeshWorker<M> {
    async fn run(self: Arc<Self>, ctx: WorkerContext) {
        let _lease = match self.shared.arbiter.acquire(Radio::Mesh) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::error!(error = %e, "mesh cannot start");
                return;
            }
        };

        if let Err(e) = self.mesh.start().await {
            tracing::error!(error = %e, "mesh attach failed");
            return;
        }
        let _attached = Attached(self.mesh.clone());

        if let Some(address) = self.mesh.local_address() {
            self.shared.set_identity(address);
        }
        ctx.mark_active();

        let cfg = &self.shared.config.mesh;
        let mut publish = tokio::time::interval(Duration::from_millis(cfg.publish_interval_ms));
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown() => break,
                received = self.mesh.recv() => match received {
                    Ok(datagram) => {
                        let ingress = self.ingress.clone();
                        tokio::spawn(async move {
                            let _ = ingress.handle(datagram).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "mesh receive failed");
                        if !ctx.sleep(RECV_RETRY).await {
                            break;
                        }
                    }
                },
                _ = publish.tick(), if cfg.publish_self => self.publish_own().await,
            }
        }
        tracing::debug!("mesh worker leaving");
    }

    fn halt(&self) {
        self.mesh.stop();
    }
}

// ==============================================================================
// wifi
// ==============================================================================

pub struct WifiWorker<W: WifiDriver> {
    wifi: Arc<W>,
    shared: SharedState,
}

/// drops the association when dropped
struct Associated<W: WifiDriver>(Arc<W>);

impl<W: WifiDriver> Drop for Associated<W> {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

impl<W: WifiDriver> WifiWorker<W> {
    pub fn new(wifi: Arc<W>, shared: SharedState) -> Self {
        Self { wifi, shared }
    }

    pub fn driver(&self) -> &Arc<W> {
        &self.wifi
    }
}

impl<W: WifiDriver> SubsystemWorker for WifiWorker<W> {
    async fn run(self: Arc<Self>, ctx: WorkerContext) {
        let _lease = match self.shared.arbiter.acquire(Radio::Wifi) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::error!(error = %e, "wifi cannot start");
                return;
            }
        };

        if let Err(e) = self.wifi.connect().await {
            tracing::error!(error = %e, "wifi association failed");
            return;
        }
        let _associated = Associated(self.wifi.clone());
        ctx.mark_active();

        ctx.shutdown().await;
        tracing::debug!("wifi worker leaving");
    }

    fn halt(&self) {
        self.wifi.disconnect();
    }
}

// ==============================================================================
// http egress
// ==============================================================================

pub struct HttpEgressWorker {
    shared: SharedState,
}

impl HttpEgressWorker {
    pub fn new(shared: SharedState) -> Self {
        Self { shared }
    }
}

impl SubsystemWorker for HttpEgressWorker {
    async fn run(self: Arc<Self>, ctx: WorkerContext) {
        ctx.mark_active();
        self.shared.nodes.log_contents().await;

        let period = Duration::from_millis(self.shared.config.cloud.interval_ms);
        loop {
            self.shared.send_all_now().await;
            if !ctx.sleep(period).await {
                break;
            }
        }
        tracing::debug!("http egress worker leaving");
    }
}

// ==============================================================================
// sensors
// ==============================================================================

pub struct SensorWorker<S: SensorBank> {
    bank: Arc<S>,
    shared: SharedState,
}

/// powers the bank down when dropped
struct Powered<S: SensorBank>(Arc<S>);

impl<S: SensorBank> Drop for Powered<S> {
    fn drop(&mut self) {
        self.0.power_down();
    }
}

impl<S: SensorBank> SensorWorker<S> {
    pub fn new(bank: Arc<S>, shared: SharedState) -> Self {
        Self { bank, shared }
    }

    /// read the bank and replace the gateway's own reading
    async fn sample(&self) -> SensorReading {
        let reading = SensorReading::new(self.shared.identity(), local_timestamp(), self.bank.read());
        if self.shared.config.logging.show_sensor_data {
            let c = &reading.channels;
            tracing::info!(
                t = c.temperature,
                ua = c.air_humidity,
                us = c.soil_moisture,
                p = c.particulates,
                "own reading"
            );
        }
        *self.shared.own_reading.write().await = reading.clone();
        reading
    }
}

impl<S: SensorBank> SubsystemWorker for SensorWorker<S> {
    async fn run(self: Arc<Self>, ctx: WorkerContext) {
        if let Err(e) = self.bank.power_up() {
            tracing::error!(error = %e, "sensor bank power-up failed");
            return;
        }
        let _powered = Powered(self.bank.clone());

        let cfg = &self.shared.config.sensors;
        let attempts = cfg.ready_attempts.max(1);
        let mut ready = false;
        for attempt in 1..=attempts {
            if self.sample().await.channels.all_nonzero() {
                ready = true;
                break;
            }
            tracing::debug!(attempt, attempts, "sensors not ready yet");
            if attempt < attempts && !ctx.sleep(Duration::from_millis(cfg.ready_interval_ms)).await {
                return;
            }
        }

        if ready {
            ctx.mark_active();
        } else {
            tracing::warn!(attempts, "sensors still reading zero; will report active once they settle");
        }

        let period = Duration::from_millis(cfg.sample_interval_ms);
        while ctx.sleep(period).await {
            let reading = self.sample().await;
            if !ready && reading.channels.all_nonzero() {
                ready = true;
                ctx.mark_active();
            }
        }
        tracing::debug!("sensor worker leaving");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, LifecycleConfig};
    use crate::hal::MockIndicators;
    use crate::mesh::LoopbackMesh;
    use crate::radio::Radio;
    use crate::sensors::SimulatedSensors;
    use crate::subsystem::{SubsystemController, SubsystemKind, SubsystemState};
    use crate::wifi::SimulatedWifi;

    fn fast_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.lifecycle = LifecycleConfig {
            enable_timeout_ms: 500,
            disable_grace_ms: 200,
        };
        config.mesh.publish_interval_ms = 20;
        config.sensors.ready_interval_ms = 10;
        config.sensors.sample_interval_ms = 10;
        config.wifi.associate_ms = 5;
        config
    }

    fn indicators() -> Arc<MockIndicators> {
        Arc::new(MockIndicators::new())
    }

    #[tokio::test]
    async fn test_mesh_worker_ingests_and_publishes() {
        let shared = SharedState::new(fast_config()).unwrap();
        let mesh = Arc::new(LoopbackMesh::new("fd00::a"));
        let ingress = Arc::new(MeshIngress::new(shared.nodes.clone(), &shared.config.mesh, false));
        let ctl = SubsystemController::new(
            SubsystemKind::Mesh,
            MeshWorker::new(mesh.clone(), shared.clone(), ingress),
            &shared.config.lifecycle,
            indicators(),
            15,
        );

        ctl.enable().await.unwrap();
        assert_eq!(shared.arbiter.holder(), Some(Radio::Mesh));
        assert_eq!(shared.identity(), "fd00::a");

        mesh.inject("sensor", br#"{"e":"addr1","d":"2024-01-01T00:00:00","t":25.5}"#);
        for _ in 0..50 {
            if !shared.nodes.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(shared.nodes.len().await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mesh.sent().is_empty());
        assert_eq!(mesh.sent()[0].resource, "sensor");

        ctl.disable().await.unwrap();
        assert!(!mesh.is_running());
        assert_eq!(shared.arbiter.holder(), None);
    }

    #[tokio::test]
    async fn test_wifi_refused_while_mesh_holds_radio() {
        let shared = SharedState::new(fast_config()).unwrap();
        let _mesh_lease = shared.arbiter.acquire(Radio::Mesh).unwrap();
        let wifi = Arc::new(SimulatedWifi::new(&shared.config.wifi));
        let ctl = SubsystemController::new(
            SubsystemKind::Wifi,
            WifiWorker::new(wifi.clone(), shared.clone()),
            &shared.config.lifecycle,
            indicators(),
            19,
        );

        assert!(ctl.enable().await.is_err());
        assert!(!wifi.is_connected());
        assert_eq!(shared.arbiter.violations(), 1);
        ctl.disable().await.unwrap();
        assert_eq!(ctl.state(), SubsystemState::Inactive);
    }

    #[tokio::test]
    async fn test_wifi_worker_disconnects_on_disable() {
        let shared = SharedState::new(fast_config()).unwrap();
        let wifi = Arc::new(SimulatedWifi::new(&shared.config.wifi));
        let ctl = SubsystemController::new(
            SubsystemKind::Wifi,
            WifiWorker::new(wifi.clone(), shared.clone()),
            &shared.config.lifecycle,
            indicators(),
            19,
        );

        ctl.enable().await.unwrap();
        assert!(wifi.is_connected());
        assert_eq!(shared.arbiter.holder(), Some(Radio::Wifi));

        ctl.disable().await.unwrap();
        assert!(!wifi.is_connected());
        assert_eq!(shared.arbiter.holder(), None);
    }

    #[tokio::test]
    async fn test_http_worker_uploads_until_disabled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count = accepted.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                drop(sock);
            }
        });

        let mut config = fast_config();
        config.cloud.host = "127.0.0.1".to_string();
        config.cloud.port = port;
        config.cloud.interval_ms = 20;
        let shared = SharedState::new(config).unwrap();
        let ctl = SubsystemController::new(
            SubsystemKind::HttpEgress,
            HttpEgressWorker::new(shared.clone()),
            &shared.config.lifecycle,
            indicators(),
            21,
        );

        ctl.enable().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctl.disable().await.unwrap();
        let sent = accepted.load(std::sync::atomic::Ordering::SeqCst);
        assert!(sent >= 2, "only {} uploads", sent);
        assert_eq!(ctl.status().forced_terminations, 0);
    }

    #[tokio::test]
    async fn test_sensor_worker_waits_for_nonzero_values() {
        let shared = SharedState::new(fast_config()).unwrap();
        let bank = Arc::new(SimulatedSensors::new(2));
        let ctl = SubsystemController::new(
            SubsystemKind::Sensors,
            SensorWorker::new(bank, shared.clone()),
            &shared.config.lifecycle,
            indicators(),
            22,
        );

        ctl.enable().await.unwrap();
        let own = shared.own_reading().await;
        assert!(own.channels.all_nonzero());
        assert_eq!(own.address, "unknown");
        ctl.disable().await.unwrap();
    }
}
