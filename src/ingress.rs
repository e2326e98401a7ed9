//! ==============================================================================
//! ingress.rs - mesh "sensor" resource handler
//! ==============================================================================
//!
//! purpose:
//!     turns one inbound mesh datagram into a NodeTable upsert. delivery is
//!     non-confirmable, so a bad message is logged and dropped; there is
//!     nobody to send an error back to.
//!
//! truncation:
//!     the payload is copied into a max_payload byte buffer that keeps one byte
//!     spare, so anything longer than max_payload - 1 bytes is cut short, not
//!     rejected. a cut envelope normally fails json parsing and is dropped as
//!     malformed.
//!
//! identity:
//!     the table key is the address inside the envelope, not the transport
//!     source. a peer that misreports its address is taken at its word.
//!
//! ==============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::codec;
use crate::config::MeshConfig;
use crate::domain::local_timestamp;
use crate::error::IngressError;
use crate::mesh::MeshDatagram;
use crate::node_table::{SharedNodeTable, Upsert};

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    truncated: AtomicU64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IngressStats {
    pub accepted: u64,
    pub dropped: u64,
    pub truncated: u64,
    pub last_error: Option<String>,
}

pub struct MeshIngress {
    table: SharedNodeTable,
    resource: String,
    max_payload: usize,
    show_data: bool,
    counters: Counters,
    last_error: Mutex<Option<IngressError>>,
}

impl MeshIngress {
    pub fn new(table: SharedNodeTable, mesh: &MeshConfig, show_data: bool) -> Self {
        Self {
            table,
            resource: mesh.resource.clone(),
            max_payload: mesh.max_payload,
            show_data,
            counters: Counters::default(),
            last_error: Mutex::new(None),
        }
    }

    /// handle one datagram; errors are already logged when this returns
    pub async fn handle(&self, datagram: MeshDatagram) -> Result<Upsert, IngressError> {
        match self.accept(&datagram).await {
            Ok(outcome) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(outcome)
            }
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                match &err {
                    IngressError::UnknownResource(_) => {
                        tracing::debug!(source = %datagram.source, error = %err, "datagram ignored")
                    }
                    _ => tracing::warn!(source = %datagram.source, error = %err, "mesh message dropped"),
                }
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    async fn accept(&self, datagram: &MeshDatagram) -> Result<Upsert, IngressError> {
        if datagram.resource != self.resource {
            return Err(IngressError::UnknownResource(datagram.resource.clone()));
        }

        let limit = self.max_payload.saturating_sub(1);
        let mut payload = datagram.payload.as_slice();
        if payload.len() > limit {
            tracing::warn!(
                source = %datagram.source,
                len = payload.len(),
                kept = limit,
                "mesh payload truncated"
            );
            self.counters.truncated.fetch_add(1, Ordering::Relaxed);
            payload = &payload[..limit];
        }

        let reading = codec::decode(payload)?;
        if self.show_data {
            let c = &reading.channels;
            tracing::info!(
                node = %reading.address,
                at = %reading.timestamp,
                t = c.temperature,
                ua = c.air_humidity,
                us = c.soil_moisture,
                p = c.particulates,
                "mesh reading"
            );
        }

        let address = reading.address.clone();
        Ok(self.table.upsert(&address, reading, &local_timestamp()).await)
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            truncated: self.counters.truncated.load(Ordering::Relaxed),
            last_error: self.last_error().map(|e| e.to_string()),
        }
    }

    pub fn last_error(&self) -> Option<IngressError> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }
}
