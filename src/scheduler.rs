use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::automation::{AutomationCycle, CycleReport};
use crate::engine::Engine;

/// How often each tenant's compactor checks its WAL.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Something the scheduler can run once per tick.
#[async_trait]
pub trait Cycle: Send + Sync + 'static {
    async fn run_cycle(&self) -> CycleReport;
}

#[async_trait]
impl Cycle for AutomationCycle {
    async fn run_cycle(&self) -> CycleReport {
        self.run().await
    }
}

struct Shared {
    cycle: Arc<dyn Cycle>,
    in_flight: AtomicBool,
    skipped: AtomicU64,
}

/// Clears the in-flight latch when the run ends, including on panic.
struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

impl Shared {
    /// Take the latch or count a skip.
    fn try_begin(self: &Arc<Self>) -> Option<InFlight> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(crate::observability::AUTOMATION_SKIPPED_TICKS_TOTAL).increment(1);
            debug!("automation cycle still running, tick skipped");
            return None;
        }
        Some(InFlight(self.clone()))
    }

    fn spawn_run(self: &Arc<Self>) {
        let Some(guard) = self.try_begin() else {
            return;
        };
        let cycle = self.cycle.clone();
        tokio::spawn(async move {
            let _guard = guard;
            cycle.run_cycle().await;
        });
    }
}

async fn tick_loop(shared: Arc<Shared>, period: Duration, token: CancellationToken) {
    // The run at start is spawned by `Scheduler::start`; the first tick is one period later.
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => shared.spawn_run(),
        }
    }
}

/// Periodic driver for the automation cycle. At most one run is in flight;
/// ticks that arrive while a run is active are dropped, not queued.
pub struct Scheduler {
    shared: Arc<Shared>,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(cycle: Arc<dyn Cycle>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cycle,
                in_flight: AtomicBool::new(false),
                skipped: AtomicU64::new(0),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Start ticking every `period`, running once right away.
    /// Returns `false` if the scheduler is already running.
    pub fn start(&self, period: Duration) -> bool {
        let mut timer = self.timer.lock().unwrap_or_else(|p| p.into_inner());
        if timer.is_some() {
            return false;
        }
        self.shared.spawn_run();
        let token = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(self.shared.clone(), period, token.clone()));
        *timer = Some((token, handle));
        info!(interval_ms = period.as_millis() as u64, "automation scheduler started");
        true
    }

    /// Stop ticking. A run already in flight finishes on its own.
    pub fn stop(&self) {
        let taken = self.timer.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((token, _handle)) = taken {
            token.cancel();
            info!("automation scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    /// Whether a cycle is executing right now.
    pub fn cycle_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Run one cycle now and wait for it, unless one is already in flight.
    pub async fn trigger(&self) -> Option<CycleReport> {
        let _guard = self.shared.try_begin()?;
        Some(self.shared.cycle.run_cycle().await)
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background task that compacts a tenant's WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(tenant = %engine.tenant, appends, "compacted WAL"),
            Err(e) => tracing::error!(tenant = %engine.tenant, error = %e, "WAL compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Counts runs; each run blocks until the test adds a permit.
    struct GatedCycle {
        runs: AtomicUsize,
        gate: Semaphore,
    }

    impl GatedCycle {
        fn new(open: bool) -> Arc<Self> {
            let permits = if open { Semaphore::MAX_PERMITS } else { 0 };
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                gate: Semaphore::new(permits),
            })
        }
    }

    #[async_trait]
    impl Cycle for GatedCycle {
        async fn run_cycle(&self) -> CycleReport {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            CycleReport::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn start_runs_immediately_and_only_once() {
        let cycle = GatedCycle::new(true);
        let scheduler = Scheduler::new(cycle.clone());
        assert!(!scheduler.is_running());
        assert!(scheduler.start(Duration::from_secs(3600)));
        assert!(!scheduler.start(Duration::from_secs(3600)));
        assert!(scheduler.is_running());
        settle().await;
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restartable() {
        let cycle = GatedCycle::new(true);
        let scheduler = Scheduler::new(cycle.clone());
        scheduler.stop();
        assert!(scheduler.start(Duration::from_secs(3600)));
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
        settle().await;
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 1);

        assert!(scheduler.start(Duration::from_secs(3600)));
        settle().await;
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 2);
        scheduler.stop();
    }

    #[tokio::test]
    async fn initial_run_survives_immediate_stop() {
        let cycle = GatedCycle::new(true);
        let scheduler = Scheduler::new(cycle.clone());
        scheduler.start(Duration::from_secs(3600));
        assert!(scheduler.cycle_in_flight());
        scheduler.stop();
        settle().await;
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.cycle_in_flight());
    }

    #[tokio::test]
    async fn first_tick_waits_one_period() {
        let cycle = GatedCycle::new(true);
        let scheduler = Scheduler::new(cycle.clone());
        scheduler.start(Duration::from_millis(200));
        settle().await;
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.skipped_ticks(), 0);
        scheduler.stop();
    }

    #[tokio::test]
    async fn overlapping_ticks_are_skipped() {
        let cycle = GatedCycle::new(false);
        let scheduler = Scheduler::new(cycle.clone());
        scheduler.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(cycle.runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.skipped_ticks() >= 2);
        assert!(scheduler.cycle_in_flight());
        assert!(scheduler.trigger().await.is_none());

        scheduler.stop();
        cycle.gate.add_permits(1);
        settle().await;
        assert!(!scheduler.cycle_in_flight());
    }

    #[tokio::test]
    async fn trigger_runs_when_idle() {
        let cycle = GatedCycle::new(true);
        let scheduler = Scheduler::new(cycle.clone());
        assert_eq!(scheduler.trigger().await, Some(CycleReport::default()));
        assert_eq!(scheduler.trigger().await, Some(CycleReport::default()));
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_running());
    }
}
