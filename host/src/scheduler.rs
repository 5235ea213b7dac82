//! ==============================================================================
//! scheduler.rs - fixed-interval sample-then-broadcast loop
//! ==============================================================================
//!
//! purpose:
//!     drives the tick: sample every device, record the set in history, push
//!     it to every subscriber.
//!
//! overlap policy:
//!     ticks are serialized. `run` awaits each tick before polling the interval
//!     again and uses `MissedTickBehavior::Skip`, so a tick that overruns the
//!     period causes the missed ticks to be skipped, never bursted. `tick` holds
//!     a mutex for its whole duration, so direct callers serialize too.
//!
//! relationships:
//!     - uses: sampler.rs, subscribers.rs, history.rs
//!     - used by: main.rs (spawned for the process lifetime)
//!
//! ==============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::domain::SnapshotSet;
use crate::history::History;
use crate::registry::DeviceRegistry;
use crate::sampler::Sampler;
use crate::subscribers::{BroadcastReport, SubscriberRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Ticking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub tick: u64,
    pub devices: usize,
    pub report: BroadcastReport,
}

pub struct BroadcastScheduler {
    registry: Arc<DeviceRegistry>,
    sampler: Arc<Sampler>,
    subscribers: Arc<SubscriberRegistry>,
    history: Arc<History>,
    interval: Duration,
    show_device_data: bool,
    ticks: AtomicU64,
    tick_lock: Mutex<()>,
}

impl BroadcastScheduler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sampler: Arc<Sampler>,
        subscribers: Arc<SubscriberRegistry>,
        history: Arc<History>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            sampler,
            subscribers,
            history,
            interval,
            show_device_data: false,
            ticks: AtomicU64::new(0),
            tick_lock: Mutex::new(()),
        }
    }

    /// Log every snapshot at info level.
    pub fn with_device_logging(mut self, enabled: bool) -> Self {
        self.show_device_data = enabled;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Completed ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        match self.tick_lock.try_lock() {
            Ok(_) => SchedulerState::Idle,
            Err(_) => SchedulerState::Ticking,
        }
    }

    /// Run one sample-then-broadcast cycle.
    pub async fn tick(&self) -> Result<TickOutcome, tokio::task::JoinError> {
        let _ticking = self.tick_lock.lock().await;
        let tick = self.ticks.load(Ordering::SeqCst) + 1;

        // device reads are synchronous native calls
        let registry = Arc::clone(&self.registry);
        let sampler = Arc::clone(&self.sampler);
        let set = tokio::task::spawn_blocking(move || sampler.sample_all(&registry, tick)).await?;
        let set = Arc::new(set);

        if self.show_device_data {
            log_snapshots(&set);
        }

        self.history.push(Arc::clone(&set)).await;
        let report = self.subscribers.broadcast(&set);
        self.ticks.store(tick, Ordering::SeqCst);

        debug!(
            tick,
            devices = set.len(),
            delivered = report.delivered,
            lagging = report.lagging,
            removed = report.removed,
            "tick complete"
        );
        Ok(TickOutcome {
            tick,
            devices: set.len(),
            report,
        })
    }

    /// Tick on the fixed period until `shutdown` resolves. Stops between ticks only.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval_ms = self.interval.as_millis() as u64, "starting device polling");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "sampling task failed; tick skipped");
                    }
                }
            }
        }
        info!(ticks = self.ticks(), "device polling stopped");
    }
}

fn log_snapshots(set: &SnapshotSet) {
    for s in &set.snapshots {
        info!(
            tick = set.tick,
            device = s.index,
            gpu = ?s.utilization.gpu,
            temperature = ?s.temperature,
            clock = ?s.clock,
            power_mw = ?s.power_usage,
            fan = ?s.fan_speed,
            "[GPU]"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockHal;

    fn scheduler(devices: u32) -> (BroadcastScheduler, Arc<SubscriberRegistry>, Arc<History>) {
        let hal = Arc::new(MockHal::new(devices));
        let registry = Arc::new(DeviceRegistry::enumerate(hal.as_ref()).unwrap());
        let subscribers = Arc::new(SubscriberRegistry::new());
        let history = Arc::new(History::new(16));
        let scheduler = BroadcastScheduler::new(
            registry,
            Arc::new(Sampler::new(hal)),
            Arc::clone(&subscribers),
            Arc::clone(&history),
            Duration::from_millis(10),
        );
        (scheduler, subscribers, history)
    }

    #[tokio::test]
    async fn ticks_without_subscribers() {
        let (scheduler, _, history) = scheduler(2);

        for expected in 1..=3 {
            let outcome = scheduler.tick().await.unwrap();
            assert_eq!(outcome.tick, expected);
            assert_eq!(outcome.devices, 2);
            assert_eq!(outcome.report, BroadcastReport::default());
        }
        assert_eq!(scheduler.ticks(), 3);
        assert_eq!(history.len().await, 3);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn late_subscriber_gets_the_next_tick_only() {
        let (scheduler, subscribers, _) = scheduler(1);

        scheduler.tick().await.unwrap();
        let (_, mut rx) = subscribers.subscribe(4);
        scheduler.tick().await.unwrap();

        assert_eq!(rx.recv().await.unwrap().tick, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_devices_broadcast_empty_sets() {
        let (scheduler, subscribers, _) = scheduler(0);
        let (_, mut rx) = subscribers.subscribe(4);

        let outcome = scheduler.tick().await.unwrap();
        assert_eq!(outcome.devices, 0);
        assert!(rx.recv().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (scheduler, subscribers, _) = scheduler(2);
        let (_, mut rx) = subscribers.subscribe(64);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            let _ = stop_tx.send(());
        });
        scheduler
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        stopper.await.unwrap();

        let ticks = scheduler.ticks();
        assert!(ticks >= 2, "expected several ticks, got {ticks}");

        let mut last = 0;
        while let Ok(set) = rx.try_recv() {
            assert_eq!(set.tick, last + 1);
            assert_eq!(set.len(), 2);
            last = set.tick;
        }
        assert_eq!(last, ticks);
    }
}
