//! RF front-end arbitration.
//!
//! The gateway has one antenna shared by the mesh radio and WiFi. Whoever
//! wants to transmit takes a [`RadioLease`]; the lease is released when it is
//! dropped, including when the owning task is aborted.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RadioError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Radio {
    Mesh,
    Wifi,
}

impl fmt::Display for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Radio::Mesh => write!(f, "mesh"),
            Radio::Wifi => write!(f, "wifi"),
        }
    }
}

#[derive(Default)]
struct ArbiterState {
    holder: Mutex<Option<Radio>>,
    violations: AtomicU64,
    grants: AtomicU64,
}

/// single owner of the shared front-end
#[derive(Clone, Default)]
pub struct RadioArbiter {
    state: Arc<ArbiterState>,
}

impl RadioArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, radio: Radio) -> Result<RadioLease, RadioError> {
        let mut holder = self
            .state
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(current) = *holder {
            self.state.violations.fetch_add(1, Ordering::SeqCst);
            tracing::error!(wanted = %radio, holder = %current, "rf front-end already in use");
            return Err(RadioError::Busy {
                wanted: radio,
                holder: current,
            });
        }

        *holder = Some(radio);
        self.state.grants.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(radio = %radio, "rf front-end acquired");
        Ok(RadioLease {
            radio,
            state: self.state.clone(),
        })
    }

    pub fn holder(&self) -> Option<Radio> {
        *self
            .state
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// refused acquisitions since startup
    pub fn violations(&self) -> u64 {
        self.state.violations.load(Ordering::SeqCst)
    }

    pub fn grants(&self) -> u64 {
        self.state.grants.load(Ordering::SeqCst)
    }
}

/// proof of exclusive use of the front-end
pub struct RadioLease {
    radio: Radio,
    state: Arc<ArbiterState>,
}

impl RadioLease {
    pub fn radio(&self) -> Radio {
        self.radio
    }
}

impl Drop for RadioLease {
    fn drop(&mut self) {
        let mut holder = self
            .state
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *holder == Some(self.radio) {
            *holder = None;
        }
        tracing::debug!(radio = %self.radio, "rf front-end released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_lease() {
        let arbiter = RadioArbiter::new();
        let lease = arbiter.acquire(Radio::Mesh).unwrap();
        assert_eq!(arbiter.holder(), Some(Radio::Mesh));

        let err = arbiter.acquire(Radio::Wifi).err().unwrap();
        assert_eq!(
            err,
            RadioError::Busy {
                wanted: Radio::Wifi,
                holder: Radio::Mesh
            }
        );
        assert_eq!(arbiter.violations(), 1);

        drop(lease);
        assert_eq!(arbiter.holder(), None);
        let _wifi = arbiter.acquire(Radio::Wifi).unwrap();
        assert_eq!(arbiter.holder(), Some(Radio::Wifi));
        assert_eq!(arbiter.grants(), 2);
    }

    #[tokio::test]
    async fn test_lease_released_when_task_aborted() {
        let arbiter = RadioArbiter::new();
        let a = arbiter.clone();
        let handle = tokio::spawn(async move {
            let _lease = a.acquire(Radio::Mesh).unwrap();
            std::future::pending::<()>().await;
        });
        while arbiter.holder().is_none() {
            tokio::task::yield_now().await;
        }
        handle.abort();
        let _ = handle.await;
        assert_eq!(arbiter.holder(), None);
    }
}
