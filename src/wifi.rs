//! ==============================================================================
//! wifi.rs - wifi station boundary
//! ==============================================================================
//!
//! purpose:
//!     the uplink radio driver is external. the gateway only connects,
//!     disconnects and asks whether it is associated.
//!
//! implementations:
//!     - SimulatedWifi: fixed association delay, records every call. the
//!       binary uses it on hosts where the uplink is the machine's own network.
//!
//! ==============================================================================

use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::WifiConfig;

pub trait WifiDriver: Send + Sync + 'static {
    /// associate with the configured access point
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// drop the association. synchronous and idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

pub struct SimulatedWifi {
    ssid: String,
    associate: Duration,
    connected: AtomicBool,
    refuse: AtomicBool,
    events: Mutex<Vec<(Instant, &'static str)>>,
}

impl SimulatedWifi {
    pub fn new(config: &WifiConfig) -> Self {
        Self {
            ssid: config.ssid.clone(),
            associate: Duration::from_millis(config.associate_ms),
            connected: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    /// make later connect() calls fail, as if the access point were gone
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// connect/disconnect calls with the instant they happened
    pub fn events(&self) -> Vec<(Instant, &'static str)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, what: &'static str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), what));
        }
    }
}

impl WifiDriver for SimulatedWifi {
    async fn connect(&self) -> Result<()> {
        tokio::time::sleep(self.associate).await;
        if self.refuse.load(Ordering::SeqCst) {
            anyhow::bail!("access point {} not found", self.ssid);
        }
        self.connected.store(true, Ordering::SeqCst);
        self.record("connect");
        tracing::info!(ssid = %self.ssid, "wifi associated");
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.record("disconnect");
            tracing::info!(ssid = %self.ssid, "wifi disassociated");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> WifiConfig {
        WifiConfig {
            associate_ms: 5,
            ..WifiConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let wifi = SimulatedWifi::new(&quick());
        assert!(!wifi.is_connected());
        wifi.connect().await.unwrap();
        assert!(wifi.is_connected());
        wifi.disconnect();
        wifi.disconnect();
        assert!(!wifi.is_connected());
        let names: Vec<&str> = wifi.events().into_iter().map(|(_, e)| e).collect();
        assert_eq!(names, vec!["connect", "disconnect"]);
    }

    #[tokio::test]
    async fn test_refused_association() {
        let wifi = SimulatedWifi::new(&quick());
        wifi.set_refuse(true);
        assert!(wifi.connect().await.is_err());
        assert!(!wifi.is_connected());
    }
}
