//! ==============================================================================
//! scheduler.rs - mesh / wifi time-division
//! ==============================================================================
//!
//! purpose:
//!     mesh and wifi share one rf front-end. the gateway listens on the mesh
//!     nearly all the time and, once per alternation period, hands the radio
//!     to wifi long enough to upload everything it has collected.
//!
//! cycle (every step runs whatever the previous one returned; no rollback):
//!     1. disable mesh
//!     2. settle (radio_release_ms)
//!     3. enable wifi, wait for association (wifi_associate_ms)
//!     4. enable sensors, wait for sampling (sensor_sample_ms), disable sensors
//!     5. upload own reading + node table snapshot
//!     6. disable wifi, settle (wifi_release_ms)
//!     7. enable mesh
//!
//! overlap:
//!     each tick spawns its own cycle task. a tick that fires while a cycle is
//!     still running is skipped with a warning instead of running a second
//!     cycle alongside it.
//!
//! ==============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::AlternationConfig;
use crate::egress::EgressSummary;
use crate::error::SubsystemError;
use crate::manager::SubsystemManager;
use crate::mesh::MeshStack;
use crate::sensors::SensorBank;
use crate::wifi::WifiDriver;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStep {
    MeshDisable,
    RadioSettle,
    WifiEnable,
    WifiAssociate,
    SensorsEnable,
    SensorSample,
    SensorsDisable,
    CloudUpload,
    WifiDisable,
    WifiSettle,
    MeshEnable,
}

/// fixed order of one cycle
pub const CYCLE_SEQUENCE: [CycleStep; 11] = [
    CycleStep::MeshDisable,
    CycleStep::RadioSettle,
    CycleStep::WifiEnable,
    CycleStep::WifiAssociate,
    CycleStep::SensorsEnable,
    CycleStep::SensorSample,
    CycleStep::SensorsDisable,
    CycleStep::CloudUpload,
    CycleStep::WifiDisable,
    CycleStep::WifiSettle,
    CycleStep::MeshEnable,
];

#[derive(Clone, Debug, Serialize)]
pub struct StepOutcome {
    pub step: CycleStep,
    /// soft failure reported by the step, if any
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub steps: Vec<StepOutcome>,
    pub upload: EgressSummary,
    pub elapsed_ms: u64,
}

impl CycleReport {
    pub fn order(&self) -> Vec<CycleStep> {
        self.steps.iter().map(|s| s.step).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_some())
    }
}

pub struct AlternationScheduler<M: MeshStack, W: WifiDriver, S: SensorBank> {
    manager: Arc<SubsystemManager<M, W, S>>,
    timing: AlternationConfig,
    running: Mutex<()>,
    cycles: AtomicU64,
    skipped: AtomicU64,
}

impl<M: MeshStack, W: WifiDriver, S: SensorBank> AlternationScheduler<M, W, S> {
    pub fn new(manager: Arc<SubsystemManager<M, W, S>>) -> Self {
        let timing = manager.config().alternation.clone();
        Self {
            manager,
            timing,
            running: Mutex::new(()),
            cycles: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// start the periodic timer; the first cycle runs one interval from now
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.timing.interval();
        tokio::spawn(async move {
            tracing::info!(period_s = period.as_secs(), "alternation scheduler started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler.try_cycle().await;
                });
            }
        })
    }

    /// waits for a cycle in progress; no cycle starts while the guard is held
    pub async fn idle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.running.lock().await
    }

    /// run a cycle unless one is already in progress
    pub async fn try_cycle(&self) -> Option<CycleReport> {
        let Ok(_running) = self.running.try_lock() else {
            self.skipped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!("alternation tick skipped: previous cycle still running");
            return None;
        };
        Some(self.run_cycle().await)
    }

    /// one full cycle; callers must not overlap it with another
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let m = &self.manager;
        let t = &self.timing;
        let mut steps = Vec::with_capacity(CYCLE_SEQUENCE.len());
        tracing::info!(cycle, "alternation cycle: mesh -> wifi");

        record(&mut steps, CycleStep::MeshDisable, m.mesh.disable().await);
        settle(&mut steps, CycleStep::RadioSettle, t.radio_release_ms).await;

        record(&mut steps, CycleStep::WifiEnable, m.wifi.enable().await);
        settle(&mut steps, CycleStep::WifiAssociate, t.wifi_associate_ms).await;

        record(&mut steps, CycleStep::SensorsEnable, m.sensors.enable().await);
        settle(&mut steps, CycleStep::SensorSample, t.sensor_sample_ms).await;
        record(&mut steps, CycleStep::SensorsDisable, m.sensors.disable().await);

        let upload = m.shared.send_all_now().await;
        steps.push(StepOutcome {
            step: CycleStep::CloudUpload,
            error: (upload.failed > 0).then(|| format!("{} of {} sends failed", upload.failed, upload.attempted)),
        });

        record(&mut steps, CycleStep::WifiDisable, m.wifi.disable().await);
        settle(&mut steps, CycleStep::WifiSettle, t.wifi_release_ms).await;

        record(&mut steps, CycleStep::MeshEnable, m.mesh.enable().await);

        let report = CycleReport {
            cycle,
            steps,
            upload,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        let failures = report.failures().count();
        tracing::info!(cycle, elapsed_ms = report.elapsed_ms, failures, "alternation cycle: back on mesh");
        report
    }
}

fn record(steps: &mut Vec<StepOutcome>, step: CycleStep, result: Result<(), SubsystemError>) {
    steps.push(StepOutcome {
        step,
        error: result.err().map(|e| e.to_string()),
    });
}

async fn settle(steps: &mut Vec<StepOutcome>, step: CycleStep, ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    steps.push(StepOutcome { step, error: None });
}
