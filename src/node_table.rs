//! ==============================================================================
//! node_table.rs - latest reading per mesh peer
//! ==============================================================================
//!
//! purpose:
//!     in-memory aggregation of the most recent reading from every node the
//!     gateway has heard from. filled by ingress.rs, drained by egress.rs.
//!
//! concurrency:
//!     SharedNodeTable puts the whole table behind one rwlock. upserts take the
//!     write half; snapshot() copies the entries out under the read half so the
//!     sender never holds the lock across network i/o and never sees a table
//!     mid-update.
//!
//! retention:
//!     none. a node that stops reporting keeps its last reading forever and
//!     the table only grows. last_update is recorded so a future policy can
//!     use it.
//!
//! ==============================================================================

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::domain::SensorReading;

/// one known peer
#[derive(Clone, Debug, Serialize)]
pub struct NodeEntry {
    /// unique key: the address embedded in the peer's envelope
    pub address: String,
    /// most recent reading
    pub reading: SensorReading,
    /// local wall-clock time the entry was last written
    pub last_update: String,
    /// milliseconds since the table was created, at last write
    pub last_update_ms: u64,
    #[serde(skip)]
    pub last_update_at: Option<Instant>,
}

/// whether an upsert created or replaced an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

#[derive(Debug)]
pub struct NodeTable {
    entries: Vec<NodeEntry>,
    created: Instant,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            created: Instant::now(),
        }
    }

    /// insert a new entry or replace the reading of an existing one
    ///
    /// linear scan by address; fine for tens of nodes. insertion order is
    /// kept so iteration is deterministic.
    pub fn upsert(&mut self, address: &str, reading: SensorReading, timestamp: &str) -> Upsert {
        let now = Instant::now();
        let elapsed = now.duration_since(self.created).as_millis() as u64;

        if let Some(entry) = self.entries.iter_mut().find(|n| n.address == address) {
            entry.reading = reading;
            entry.last_update = timestamp.to_string();
            entry.last_update_ms = elapsed;
            entry.last_update_at = Some(now);
            tracing::debug!(address, "node updated");
            return Upsert::Updated;
        }

        self.entries.push(NodeEntry {
            address: address.to_string(),
            reading,
            last_update: timestamp.to_string(),
            last_update_ms: elapsed,
            last_update_at: Some(now),
        });
        tracing::info!(address, total = self.entries.len(), "new node registered");
        Upsert::Inserted
    }

    pub fn get(&self, address: &str) -> Option<&NodeEntry> {
        self.entries.iter().find(|n| n.address == address)
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// one line per node, for debug dumps
    pub fn describe(&self) -> Vec<String> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let c = &n.reading.channels;
                format!(
                    "node {}: {} | t={:.2} uA={:.2} uS={:.2} p={:.2} | seen {}",
                    i, n.address, c.temperature, c.air_humidity, c.soil_moisture, c.particulates, n.last_update
                )
            })
            .collect()
    }
}

/// clone-able handle shared by ingress, egress and the diagnostics api
#[derive(Clone, Default)]
pub struct SharedNodeTable {
    inner: Arc<RwLock<NodeTable>>,
}

impl SharedNodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, address: &str, reading: SensorReading, timestamp: &str) -> Upsert {
        self.inner.write().await.upsert(address, reading, timestamp)
    }

    /// copy of every entry, in insertion order
    pub async fn snapshot(&self) -> Vec<NodeEntry> {
        self.inner.read().await.entries().to_vec()
    }

    pub async fn get(&self, address: &str) -> Option<NodeEntry> {
        self.inner.read().await.get(address).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn log_contents(&self) {
        let table = self.inner.read().await;
        tracing::debug!(nodes = table.len(), "node table dump");
        for line in table.describe() {
            tracing::debug!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChannelValues;

    fn reading(addr: &str, t: f64) -> SensorReading {
        SensorReading::new(
            addr,
            "2024-01-01T00:00:00",
            ChannelValues {
                temperature: t,
                air_humidity: 50.0,
                soil_moisture: 20.0,
                particulates: 5.0,
            },
        )
    }

    #[test]
    fn test_upsert_same_address_keeps_one_entry() {
        let mut table = NodeTable::new();
        assert_eq!(table.upsert("addr2", reading("addr2", 10.0), "t1"), Upsert::Inserted);
        assert_eq!(table.upsert("addr2", reading("addr2", 20.0), "t2"), Upsert::Updated);

        assert_eq!(table.len(), 1);
        let entry = table.get("addr2").unwrap();
        assert_eq!(entry.reading, reading("addr2", 20.0));
        assert_eq!(entry.last_update, "t2");
    }

    #[test]
    fn test_cardinality_and_order() {
        let mut table = NodeTable::new();
        let addrs = ["a", "b", "c", "d", "e"];
        for (i, a) in addrs.iter().enumerate() {
            table.upsert(a, reading(a, i as f64), "t");
        }
        assert_eq!(table.len(), addrs.len());

        for a in &addrs[1..3] {
            table.upsert(a, reading(a, 99.0), "t");
        }
        assert_eq!(table.len(), addrs.len());

        let order: Vec<&str> = table.entries().iter().map(|n| n.address.as_str()).collect();
        assert_eq!(order, addrs);
    }

    #[test]
    fn test_describe_lists_every_node() {
        let mut table = NodeTable::new();
        table.upsert("x", reading("x", 1.0), "t");
        table.upsert("y", reading("y", 2.0), "t");
        let lines = table.describe();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("y"));
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let table = SharedNodeTable::new();
        table.upsert("a", reading("a", 1.0), "t").await;
        let snap = table.snapshot().await;

        table.upsert("a", reading("a", 2.0), "t").await;
        table.upsert("b", reading("b", 3.0), "t").await;

        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].reading.channels.temperature, 1.0);
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_keys_unique() {
        let table = SharedNodeTable::new();
        let mut handles = Vec::new();
        for i in 0..50 {
            let t = table.clone();
            handles.push(tokio::spawn(async move {
                let addr = format!("node-{}", i % 10);
                t.upsert(&addr, reading(&addr, i as f64), "t").await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(table.len().await, 10);
    }
}
