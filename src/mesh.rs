//! ==============================================================================
//! mesh.rs - mesh network stack boundary
//! ==============================================================================
//!
//! purpose:
//!     the mesh stack (attach, routing, device roles) is not ours. the gateway
//!     only needs start / stop / send / receive and the node's own address.
//!     MeshStack is that boundary.
//!
//! implementations:
//!     - UdpMeshStack: udp socket joined to the mesh-local multicast group,
//!       datagrams framed by coap.rs. used by the binary on a linux host.
//!     - LoopbackMesh: in-process channels. used by tests and demos.
//!
//! relationships:
//!     - used by: workers.rs (MeshWorker), manager.rs
//!     - uses: coap.rs (framing)
//!
//! ==============================================================================

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::coap::{Frame, SENSOR_TOKEN};
use crate::config::MeshConfig;

/// one datagram delivered by the mesh stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshDatagram {
    /// transport-level sender (informational only)
    pub source: String,
    /// resource path the datagram was posted to
    pub resource: String,
    pub payload: Vec<u8>,
}

pub trait MeshStack: Send + Sync + 'static {
    /// attach to the mesh and open the datagram endpoint
    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    /// detach and close the endpoint. synchronous and idempotent.
    fn stop(&self);

    /// post `payload` to `resource` on the mesh group (non-confirmable)
    fn send(&self, resource: &str, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// next datagram addressed to this node
    fn recv(&self) -> impl Future<Output = Result<MeshDatagram>> + Send;

    /// mesh-local address of this node, once attached
    fn local_address(&self) -> Option<String>;
}

// ==============================================================================
// udp transport
// ==============================================================================

pub struct UdpMeshStack {
    network: String,
    pan_id: u16,
    channel: u8,
    bind: String,
    group: String,
    port: u16,
    recv_buffer: usize,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    message_id: AtomicU16,
}

impl UdpMeshStack {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            network: config.network_name.clone(),
            pan_id: config.pan_id,
            channel: config.channel,
            bind: config.bind.clone(),
            group: config.group.clone(),
            port: config.port,
            recv_buffer: recv_buffer_len(&config.resource, config.max_payload),
            socket: Mutex::new(None),
            message_id: AtomicU16::new(1),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .map_err(|_| anyhow!("mesh socket state poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("mesh stack not started"))
    }

    /// bound socket address, once started
    pub fn local_socket_addr(&self) -> Option<SocketAddr> {
        self.socket().ok().and_then(|s| s.local_addr().ok())
    }

    fn group_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .group
            .parse()
            .with_context(|| format!("invalid mesh group address: {}", self.group))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// largest frame for `resource` whose payload can still exceed max_payload - 1
/// bytes, so a datagram cut by the socket is still seen as oversized by ingress
fn recv_buffer_len(resource: &str, max_payload: usize) -> usize {
    let overhead = Frame::post(resource, &[0u8; 8], 0, &[0u8]).encode().len();
    overhead + max_payload
}

impl MeshStack for UdpMeshStack {
    async fn start(&self) -> Result<()> {
        let bind: SocketAddr = self
            .bind
            .parse()
            .with_context(|| format!("invalid mesh bind address: {}", self.bind))?;
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("failed to bind mesh socket on {}", bind))?;

        if let Ok(IpAddr::V6(group)) = self.group.parse::<IpAddr>() {
            if group.is_multicast() {
                socket
                    .join_multicast_v6(&group, 0)
                    .with_context(|| format!("failed to join mesh group {}", group))?;
                socket.set_multicast_loop_v6(false)?;
            }
        }

        tracing::info!(
            network = %self.network,
            pan_id = %format!("{:#06x}", self.pan_id),
            channel = self.channel,
            bind = %socket.local_addr()?,
            group = %self.group,
            "mesh endpoint open"
        );
        *self
            .socket
            .lock()
            .map_err(|_| anyhow!("mesh socket state poisoned"))? = Some(Arc::new(socket));
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut socket) = self.socket.lock() {
            if socket.take().is_some() {
                tracing::info!("mesh endpoint closed");
            }
        }
    }

    async fn send(&self, resource: &str, payload: &[u8]) -> Result<()> {
        let socket = self.socket()?;
        let id = self.message_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::post(resource, &SENSOR_TOKEN, id, payload).encode();
        let dest = self.group_addr()?;
        socket
            .send_to(&frame, dest)
            .await
            .with_context(|| format!("mesh send to {} failed", dest))?;
        Ok(())
    }

    async fn recv(&self) -> Result<MeshDatagram> {
        let socket = self.socket()?;
        let mut buf = vec![0u8; self.recv_buffer];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await.context("mesh receive failed")?;
            match Frame::decode(&buf[..n]) {
                Ok(frame) => {
                    tracing::debug!(
                        from = %from,
                        token = %hex::encode(&frame.token),
                        path = %frame.path(),
                        "mesh frame"
                    );
                    return Ok(MeshDatagram {
                        source: from.ip().to_string(),
                        resource: frame.path(),
                        payload: frame.payload,
                    });
                }
                Err(e) => {
                    tracing::warn!(from = %from, error = %e, raw = %hex::encode(&buf[..n.min(32)]), "undecodable mesh frame");
                }
            }
        }
    }

    fn local_address(&self) -> Option<String> {
        let addr = self.local_socket_addr()?;
        if addr.ip().is_unspecified() {
            None
        } else {
            Some(addr.ip().to_string())
        }
    }
}

// ==============================================================================
// loopback transport
// ==============================================================================

/// in-process mesh: datagrams are injected by the test, sends are recorded
pub struct LoopbackMesh {
    address: String,
    attach_delay: Duration,
    running: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<MeshDatagram>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MeshDatagram>>,
    sent: Mutex<Vec<MeshDatagram>>,
    events: Mutex<Vec<(Instant, &'static str)>>,
}

impl LoopbackMesh {
    pub fn new(address: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            address: address.into(),
            attach_delay: Duration::ZERO,
            running: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// time start() takes to "attach"
    pub fn with_attach_delay(mut self, delay: Duration) -> Self {
        self.attach_delay = delay;
        self
    }

    /// deliver a datagram as if a peer had posted it
    pub fn inject(&self, resource: &str, payload: &[u8]) {
        let _ = self.inbound_tx.send(MeshDatagram {
            source: "loopback-peer".to_string(),
            resource: resource.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<MeshDatagram> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// start/stop calls with the instant they happened
    pub fn events(&self) -> Vec<(Instant, &'static str)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, what: &'static str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), what));
        }
    }
}

impl MeshStack for LoopbackMesh {
    async fn start(&self) -> Result<()> {
        tokio::time::sleep(self.attach_delay).await;
        self.running.store(true, Ordering::SeqCst);
        self.record("start");
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.record("stop");
        }
    }

    async fn send(&self, resource: &str, payload: &[u8]) -> Result<()> {
        if !self.is_running() {
            anyhow::bail!("loopback mesh not started");
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(MeshDatagram {
                source: self.address.clone(),
                resource: resource.to_string(),
                payload: payload.to_vec(),
            });
        }
        Ok(())
    }

    async fn recv(&self) -> Result<MeshDatagram> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or_else(|| anyhow!("loopback mesh closed"))
    }

    fn local_address(&self) -> Option<String> {
        Some(self.address.clone())
    }
}
