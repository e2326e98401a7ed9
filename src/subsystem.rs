//! ==============================================================================
//! subsystem.rs - start/stop lifecycle of one background subsystem
//! ==============================================================================
//!
//! purpose:
//!     every subsystem (mesh, wifi, http egress, sensors) is a worker task plus
//!     a record of its lifecycle. SubsystemController owns both and exposes the
//!     only two operations that move the state: enable() and disable().
//!
//! lifecycle:
//!     Inactive --enable--> Starting --worker ready--> Active
//!     Active/Starting --disable--> StopRequested --worker exits--> Inactive
//!
//! ```text
//!     enable() never spawns a second worker while one is alive. disable()
//!     asks the worker to stop, waits a bounded grace period and aborts the
//!     task if it has not exited. worker resources are RAII guards, so an
//!     aborted worker still releases them.
//! ```
//!
//! relationships:
//!     - used by: manager.rs, scheduler.rs
//!     - implemented by: workers.rs
//!     - uses: hal.rs (status pin)
//!
//! ==============================================================================

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::LifecycleConfig;
use crate::error::SubsystemError;
use crate::hal::IndicatorProvider;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    Mesh,
    Wifi,
    HttpEgress,
    Sensors,
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubsystemKind::Mesh => "mesh",
            SubsystemKind::Wifi => "wifi",
            SubsystemKind::HttpEgress => "http_egress",
            SubsystemKind::Sensors => "sensors",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemState {
    Inactive,
    Starting,
    Active,
    StopRequested,
}

/// boolean that can be awaited
#[derive(Default)]
pub struct Flag {
    set: AtomicBool,
    notify: Notify,
}

impl Flag {
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// resolves once the flag is set
    pub async fn wait(&self) {
        loop {
            // registered before the check so a concurrent set() is not missed
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// lifecycle record of one subsystem
pub struct SubsystemRecord {
    kind: SubsystemKind,
    state: Mutex<SubsystemState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    active: Arc<Flag>,
    shutdown: Arc<Flag>,
    exited: Flag,
    spawned: AtomicU64,
    forced: AtomicU64,
}

/// point-in-time view of a record, for logs and the diagnostics api
#[derive(Clone, Debug, Serialize)]
pub struct SubsystemStatus {
    pub kind: SubsystemKind,
    pub state: SubsystemState,
    pub active: bool,
    pub shutdown_requested: bool,
    pub workers_spawned: u64,
    pub forced_terminations: u64,
}

impl SubsystemRecord {
    fn new(kind: SubsystemKind) -> Self {
        Self {
            kind,
            state: Mutex::new(SubsystemState::Inactive),
            worker: Mutex::new(None),
            active: Arc::new(Flag::default()),
            shutdown: Arc::new(Flag::default()),
            exited: Flag::default(),
            spawned: AtomicU64::new(0),
            forced: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    pub fn state(&self) -> SubsystemState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SubsystemState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn is_active(&self) -> bool {
        self.active.is_set()
    }

    /// true while the worker task has not finished
    pub fn worker_alive(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn status(&self) -> SubsystemStatus {
        SubsystemStatus {
            kind: self.kind,
            state: self.state(),
            active: self.active.is_set(),
            shutdown_requested: self.shutdown.is_set(),
            workers_spawned: self.spawned.load(Ordering::SeqCst),
            forced_terminations: self.forced.load(Ordering::SeqCst),
        }
    }
}

/// what a worker gets to talk back to its controller
#[derive(Clone)]
pub struct WorkerContext {
    record: Arc<SubsystemRecord>,
}

impl WorkerContext {
    pub fn kind(&self) -> SubsystemKind {
        self.record.kind
    }

    /// report that startup finished; also after enable() stopped waiting
    pub fn mark_active(&self) {
        {
            let mut state = self.record.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state == SubsystemState::Starting {
                *state = SubsystemState::Active;
            }
        }
        self.record.active.set();
        tracing::debug!(subsystem = %self.record.kind, "worker ready");
    }

    pub fn shutdown_requested(&self) -> bool {
        self.record.shutdown.is_set()
    }

    /// resolves when disable() asks the worker to stop
    pub async fn shutdown(&self) {
        self.record.shutdown.wait().await
    }

    /// sleep unless shutdown arrives first; false means stop now
    pub async fn sleep(&self, period: Duration) -> bool {
        tokio::select! {
            _ = self.record.shutdown.wait() => false,
            _ = tokio::time::sleep(period) => !self.record.shutdown.is_set(),
        }
    }
}

/// body of a subsystem
pub trait SubsystemWorker: Send + Sync + 'static {
    /// runs until `ctx.shutdown()` resolves. must call `ctx.mark_active()`
    /// once startup is complete.
    fn run(self: Arc<Self>, ctx: WorkerContext) -> impl Future<Output = ()> + Send;

    /// synchronous protocol-level stop, called by disable() before it waits
    fn halt(&self) {}
}

/// clears the active flag however the worker task ends, aborts included
struct ExitGuard {
    record: Arc<SubsystemRecord>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.record.active.clear();
        {
            let mut state = self.record.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != SubsystemState::StopRequested {
                // worker gave up on its own
                *state = SubsystemState::Inactive;
            }
        }
        self.record.exited.set();
        tracing::debug!(subsystem = %self.record.kind, "worker exited");
    }
}

pub struct SubsystemController<W: SubsystemWorker> {
    worker: Arc<W>,
    record: Arc<SubsystemRecord>,
    indicators: Arc<dyn IndicatorProvider>,
    pin: u8,
    enable_timeout: Duration,
    disable_grace: Duration,
    gate: tokio::sync::Mutex<()>,
}

impl<W: SubsystemWorker> SubsystemController<W> {
    pub fn new(
        kind: SubsystemKind,
        worker: W,
        lifecycle: &LifecycleConfig,
        indicators: Arc<dyn IndicatorProvider>,
        pin: u8,
    ) -> Self {
        if let Err(e) = indicators.set_gpio_mode(pin, "output") {
            tracing::warn!(subsystem = %kind, pin, error = %e, "status pin unavailable");
        }
        Self {
            worker: Arc::new(worker),
            record: Arc::new(SubsystemRecord::new(kind)),
            indicators,
            pin,
            enable_timeout: lifecycle.enable_timeout(),
            disable_grace: lifecycle.disable_grace(),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn kind(&self) -> SubsystemKind {
        self.record.kind
    }

    pub fn record(&self) -> Arc<SubsystemRecord> {
        self.record.clone()
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    pub fn state(&self) -> SubsystemState {
        self.record.state()
    }

    pub fn is_active(&self) -> bool {
        self.record.is_active()
    }

    pub fn status(&self) -> SubsystemStatus {
        self.record.status()
    }

    fn indicate(&self, level: bool) {
        if let Err(e) = self.indicators.write_gpio(self.pin, level) {
            tracing::warn!(subsystem = %self.kind(), pin = self.pin, error = %e, "status pin write failed");
        }
    }

    /// spawn the worker and wait (bounded) for it to report ready
    ///
    /// `Err(AlreadyActive)` and `Err(StartTimeout)` are soft outcomes: the
    /// caller logs them and carries on. after a timeout the worker keeps
    /// running and may still become active.
    pub async fn enable(&self) -> Result<(), SubsystemError> {
        let _gate = self.gate.lock().await;
        let kind = self.kind();

        if self.record.worker_alive() {
            tracing::warn!(subsystem = %kind, "enable ignored: already active");
            return Err(SubsystemError::AlreadyActive(kind));
        }
        // reap a worker that ended on its own
        drop(self.record.take_worker());

        self.record.shutdown.clear();
        self.record.active.clear();
        self.record.exited.clear();
        self.record.set_state(SubsystemState::Starting);
        self.indicate(true);

        let ctx = WorkerContext {
            record: self.record.clone(),
        };
        let worker = self.worker.clone();
        let guard = ExitGuard {
            record: self.record.clone(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            worker.run(ctx).await;
        });
        *self.record.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        self.record.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::info!(subsystem = %kind, "worker spawned");

        let ready = async {
            tokio::select! {
                _ = self.record.active.wait() => true,
                _ = self.record.exited.wait() => self.record.active.is_set(),
            }
        };
        match tokio::time::timeout(self.enable_timeout, ready).await {
            Ok(true) => {
                tracing::info!(subsystem = %kind, "subsystem active");
                Ok(())
            }
            Ok(false) => {
                drop(self.record.take_worker());
                self.indicate(false);
                let err = SubsystemError::StartFailed(kind);
                tracing::warn!(subsystem = %kind, error = %err, "enable failed");
                Err(err)
            }
            Err(_) => {
                let err = SubsystemError::StartTimeout {
                    kind,
                    waited: self.enable_timeout,
                };
                tracing::warn!(subsystem = %kind, error = %err, "enable wait expired");
                Err(err)
            }
        }
    }

    /// stop the worker; no-op when nothing is running
    ///
    /// returns `Err(ForcedTermination)` when the worker had to be aborted.
    /// the subsystem is Inactive afterwards either way.
    pub async fn disable(&self) -> Result<(), SubsystemError> {
        let _gate = self.gate.lock().await;
        let kind = self.kind();

        let handle = self.record.take_worker();
        if handle.is_none() && self.record.state() == SubsystemState::Inactive {
            tracing::debug!(subsystem = %kind, "disable ignored: not running");
            return Ok(());
        }

        self.record.set_state(SubsystemState::StopRequested);
        self.worker.halt();
        self.record.shutdown.set();

        let mut outcome = Ok(());
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.disable_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(subsystem = %kind, "worker panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    handle.abort();
                    let _ = handle.await;
                    self.record.forced.fetch_add(1, Ordering::SeqCst);
                    let err = SubsystemError::ForcedTermination {
                        kind,
                        grace: self.disable_grace,
                    };
                    tracing::error!(subsystem = %kind, error = %err, "worker aborted");
                    outcome = Err(err);
                }
            }
        }

        self.record.active.clear();
        self.record.set_state(SubsystemState::Inactive);
        self.indicate(false);
        tracing::info!(subsystem = %kind, "subsystem inactive");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockIndicators;
    use std::sync::atomic::AtomicU32;

    /// ready after `delay`, then either honours shutdown or ignores it
    struct TestWorker {
        delay: Duration,
        stubborn: bool,
        halts: AtomicU32,
        cleaned: Arc<AtomicBool>,
    }

    struct Cleanup(Arc<AtomicBool>);

    impl Drop for Cleanup {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl TestWorker {
        fn new(delay_ms: u64, stubborn: bool) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                stubborn,
                halts: AtomicU32::new(0),
                cleaned: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl SubsystemWorker for TestWorker {
        async fn run(self: Arc<Self>, ctx: WorkerContext) {
            let _cleanup = Cleanup(self.cleaned.clone());
            if !ctx.sleep(self.delay).await {
                return;
            }
            ctx.mark_active();
            if self.stubborn {
                std::future::pending::<()>().await;
            }
            ctx.shutdown().await;
        }

        fn halt(&self) {
            self.halts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn controller(worker: TestWorker, indicators: Arc<MockIndicators>) -> SubsystemController<TestWorker> {
        let lifecycle = LifecycleConfig {
            enable_timeout_ms: 200,
            disable_grace_ms: 100,
        };
        SubsystemController::new(SubsystemKind::Mesh, worker, &lifecycle, indicators, 15)
    }

    #[tokio::test]
    async fn test_enable_disable_cycle() {
        let hal = Arc::new(MockIndicators::new());
        let ctl = controller(TestWorker::new(10, false), hal.clone());
        assert_eq!(ctl.state(), SubsystemState::Inactive);

        ctl.enable().await.unwrap();
        assert_eq!(ctl.state(), SubsystemState::Active);
        assert!(ctl.is_active());
        assert_eq!(hal.level(15), Some(true));

        ctl.disable().await.unwrap();
        assert_eq!(ctl.state(), SubsystemState::Inactive);
        assert!(!ctl.is_active());
        assert_eq!(hal.level(15), Some(false));
        assert_eq!(ctl.worker().halts.load(Ordering::SeqCst), 1);
        assert!(ctl.worker().cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_enable_twice_spawns_one_worker() {
        let ctl = controller(TestWorker::new(0, false), Arc::new(MockIndicators::new()));
        ctl.enable().await.unwrap();

        let started = std::time::Instant::now();
        let second = ctl.enable().await;
        assert_eq!(second, Err(SubsystemError::AlreadyActive(SubsystemKind::Mesh)));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(ctl.status().workers_spawned, 1);
        assert_eq!(ctl.state(), SubsystemState::Active);
    }

    #[tokio::test]
    async fn test_disable_when_inactive_is_noop() {
        let ctl = controller(TestWorker::new(0, false), Arc::new(MockIndicators::new()));
        ctl.disable().await.unwrap();
        assert_eq!(ctl.state(), SubsystemState::Inactive);
        assert_eq!(ctl.worker().halts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_timeout_is_soft() {
        let ctl = controller(TestWorker::new(400, false), Arc::new(MockIndicators::new()));
        let res = ctl.enable().await;
        assert!(matches!(res, Err(SubsystemError::StartTimeout { .. })));
        assert_eq!(ctl.state(), SubsystemState::Starting);

        // a late worker is still torn down by disable
        ctl.disable().await.unwrap();
        assert_eq!(ctl.state(), SubsystemState::Inactive);
        assert_eq!(ctl.status().forced_terminations, 0);
    }

    #[tokio::test]
    async fn test_stubborn_worker_is_aborted() {
        let ctl = controller(TestWorker::new(0, true), Arc::new(MockIndicators::new()));
        ctl.enable().await.unwrap();

        let res = ctl.disable().await;
        assert!(matches!(res, Err(SubsystemError::ForcedTermination { .. })));
        assert_eq!(ctl.state(), SubsystemState::Inactive);
        assert!(!ctl.is_active());
        assert_eq!(ctl.status().forced_terminations, 1);
        // resources owned by the aborted task were dropped
        assert!(ctl.worker().cleaned.load(Ordering::SeqCst));

        // and the subsystem can be brought back up
        ctl.enable().await.unwrap();
        assert_eq!(ctl.status().workers_spawned, 2);
    }

    #[tokio::test]
    async fn test_late_ready_worker_becomes_active() {
        let lifecycle = LifecycleConfig {
            enable_timeout_ms: 50,
            disable_grace_ms: 100,
        };
        let ctl = SubsystemController::new(
            SubsystemKind::Sensors,
            TestWorker::new(150, false),
            &lifecycle,
            Arc::new(MockIndicators::new()),
            22,
        );

        assert!(matches!(ctl.enable().await, Err(SubsystemError::StartTimeout { .. })));
        assert_eq!(ctl.state(), SubsystemState::Starting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ctl.is_active());
        assert_eq!(ctl.state(), SubsystemState::Active);
        assert_eq!(ctl.status().state, SubsystemState::Active);

        ctl.disable().await.unwrap();
        assert_eq!(ctl.state(), SubsystemState::Inactive);
    }

    struct GivesUp;

    impl SubsystemWorker for GivesUp {
        async fn run(self: Arc<Self>, _ctx: WorkerContext) {}
    }

    #[tokio::test]
    async fn test_worker_that_exits_fails_enable_fast() {
        let hal = Arc::new(MockIndicators::new());
        let lifecycle = LifecycleConfig {
            enable_timeout_ms: 2_000,
            disable_grace_ms: 100,
        };
        let ctl = SubsystemController::new(SubsystemKind::Wifi, GivesUp, &lifecycle, hal.clone(), 19);

        let started = std::time::Instant::now();
        assert_eq!(ctl.enable().await, Err(SubsystemError::StartFailed(SubsystemKind::Wifi)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(ctl.state(), SubsystemState::Inactive);
        assert_eq!(hal.level(19), Some(false));

        // nothing left to stop, and a retry spawns a fresh worker
        ctl.disable().await.unwrap();
        assert!(ctl.enable().await.is_err());
        assert_eq!(ctl.status().workers_spawned, 2);
    }

    #[tokio::test]
    async fn test_flag_wait_sees_late_set() {
        let flag = Arc::new(Flag::default());
        let f = flag.clone();
        let waiter = tokio::spawn(async move { f.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
