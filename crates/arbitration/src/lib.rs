use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_types::{ConfigError, GazeTarget, SourceCategory};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Mutable per-source state. Written by the owning input source whenever a
/// new measurement arrives, read by the engine once per tick. Every access
/// goes through the [`SharedBindings`] lock.
#[derive(Debug, Clone)]
pub struct SourceState {
    pub name: String,
    pub category: SourceCategory,
    pub freshness_budget: Duration,
    pub has_update: bool,
    pub last_update: Option<Instant>,
    pub measurement: f64,
    pub target: Option<GazeTarget>,
}

impl SourceState {
    pub fn new(
        name: impl Into<String>,
        category: SourceCategory,
        freshness_budget: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            category,
            freshness_budget,
            has_update: false,
            last_update: None,
            measurement: 0.0,
            target: None,
        }
    }

    /// Records one measurement. Callers hold the shared lock for exactly the
    /// duration of this field update.
    pub fn record(&mut self, measurement: f64, target: GazeTarget, now: Instant) {
        self.has_update = true;
        self.last_update = Some(now);
        self.measurement = measurement;
        self.target = Some(target);
    }
}

/// The one lock of the system. Owns the whole source-binding slice so the
/// engine can snapshot every source together and never decides on a
/// half-updated cross-source view.
#[derive(Debug, Default)]
pub struct SharedBindings {
    inner: Mutex<Vec<SourceState>>,
}

impl SharedBindings {
    pub fn new(sources: Vec<SourceState>) -> Self {
        Self {
            inner: Mutex::new(sources),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<SourceState>> {
        self.inner.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Runs `f` on one binding under the lock. This is the only write path
    /// input sources use; the critical section is a single field update.
    pub fn with_source<R>(&self, index: usize, f: impl FnOnce(&mut SourceState) -> R) -> Option<R> {
        self.inner.lock().get_mut(index).map(f)
    }
}

/// Immutable per-tick view of one source, taken under the shared lock.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSnapshot {
    pub category: SourceCategory,
    pub freshness_budget: Duration,
    pub has_update: bool,
    /// Age of the newest measurement at snapshot time. `None` until the
    /// source has reported at least once.
    pub age: Option<Duration>,
    pub measurement: f64,
}

impl SourceSnapshot {
    /// Present and within its freshness budget plus the global grace.
    pub fn is_fresh(&self, grace: Duration) -> bool {
        self.has_update
            && self
                .age
                .is_some_and(|age| age <= self.freshness_budget + grace)
    }
}

pub fn snapshot_sources(sources: &[SourceState], now: Instant) -> Vec<SourceSnapshot> {
    sources
        .iter()
        .map(|s| SourceSnapshot {
            category: s.category,
            freshness_budget: s.freshness_budget,
            has_update: s.has_update,
            age: s.last_update.map(|t| now.saturating_duration_since(t)),
            measurement: s.measurement,
        })
        .collect()
}

/// Override phase: first source in priority order that is fresh and whose
/// measurement crosses its threshold in the category's direction.
pub fn override_winner(
    snaps: &[SourceSnapshot],
    thresholds: &[f64],
    grace: Duration,
) -> Option<usize> {
    snaps
        .iter()
        .zip(thresholds)
        .position(|(snap, threshold)| {
            snap.is_fresh(grace) && snap.category.override_fires(snap.measurement, *threshold)
        })
}

/// What the priority phase falls back to when no source is fresh.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleFallback {
    /// Control lands on the last entry of the priority list. Matches the
    /// historic scan-to-the-end behavior, so it stays the default even
    /// though it silently hands control to the least-prioritized source.
    #[default]
    LowestPriority,
    /// Keep the previous winner, or none if there never was one.
    RetainPrevious,
}

/// Priority phase: first fresh source in priority order, else the configured
/// fallback.
pub fn priority_winner(
    snaps: &[SourceSnapshot],
    grace: Duration,
    fallback: StaleFallback,
    previous: Option<usize>,
) -> Option<usize> {
    if let Some(idx) = snaps.iter().position(|snap| snap.is_fresh(grace)) {
        return Some(idx);
    }
    match fallback {
        StaleFallback::LowestPriority => snaps.len().checked_sub(1),
        StaleFallback::RetainPrevious => previous,
    }
}

/// The engine's sole output channel: one flag per source, read by that
/// source's gaze controller.
#[derive(Debug, Default)]
pub struct ActuatorBinding {
    has_control: AtomicBool,
}

impl ActuatorBinding {
    pub fn has_control(&self) -> bool {
        self.has_control.load(Ordering::Relaxed)
    }

    pub fn set_control(&self, on: bool) {
        self.has_control.store(on, Ordering::Relaxed);
    }
}

/// Lock-free view of the engine for the control API and metrics scrapes.
#[derive(Debug)]
pub struct EngineStatus {
    winner: AtomicI64,
    override_active: AtomicBool,
    tick_rate_bits: AtomicU64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            winner: AtomicI64::new(-1),
            override_active: AtomicBool::new(false),
            tick_rate_bits: AtomicU64::new(0.0f64.to_bits()),
        }
    }
}

impl EngineStatus {
    pub fn winner(&self) -> Option<usize> {
        usize::try_from(self.winner.load(Ordering::Relaxed)).ok()
    }

    pub fn override_active(&self) -> bool {
        self.override_active.load(Ordering::Relaxed)
    }

    pub fn tick_rate(&self) -> f64 {
        f64::from_bits(self.tick_rate_bits.load(Ordering::Relaxed))
    }

    fn set_winner(&self, winner: Option<usize>) {
        let raw = winner.map_or(-1, |w| w as i64);
        self.winner.store(raw, Ordering::Relaxed);
    }

    fn set_override(&self, on: bool) {
        self.override_active.store(on, Ordering::Relaxed);
    }

    fn set_tick_rate(&self, rate: f64) {
        self.tick_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub overrides_enabled: bool,
    /// Parallel to the source list whenever `overrides_enabled` is true.
    pub override_thresholds: Vec<f64>,
    /// Global slack added to every source's freshness budget.
    pub stale_grace: Duration,
    pub tick_period: Duration,
    pub stale_fallback: StaleFallback,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overrides_enabled: false,
            override_thresholds: Vec::new(),
            stale_grace: Duration::from_millis(200),
            tick_period: Duration::from_millis(20),
            stale_fallback: StaleFallback::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Winner { index: usize, by_override: bool },
    /// Nothing fresh and the fallback produced no index. Keep the previous
    /// actuator assignment untouched.
    Hold,
    /// Per-source data momentarily inconsistent. Keep everything untouched
    /// and try again next tick.
    DataGap,
}

/// Handle for cooperative shutdown of a running engine loop.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Idempotent. The loop finishes its current tick before exiting.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Arbitrates control of the gaze actuator among the configured sources.
///
/// One dedicated thread calls [`ArbitrationEngine::run`]; input sources
/// mutate their bindings concurrently through [`SharedBindings`]. Each tick
/// takes a locked cross-source snapshot, runs the override phase then the
/// priority phase, and flips exactly one actuator flag on.
pub struct ArbitrationEngine {
    shared: Arc<SharedBindings>,
    actuators: Vec<Arc<ActuatorBinding>>,
    cfg: EngineConfig,
    paused: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    status: Arc<EngineStatus>,
    governor: RateGovernor,
    names: Vec<String>,
    current_winner: Option<usize>,
    override_active: bool,
    override_source: Option<String>,
    last_status_log: Option<Instant>,
}

impl ArbitrationEngine {
    pub fn new(
        shared: Arc<SharedBindings>,
        actuators: Vec<Arc<ActuatorBinding>>,
        paused: Arc<AtomicBool>,
        cfg: EngineConfig,
    ) -> Result<Self, ConfigError> {
        let names: Vec<String> = shared.lock().iter().map(|s| s.name.clone()).collect();
        if names.len() != actuators.len() {
            return Err(ConfigError::LengthMismatch {
                sources: names.len(),
                actuators: actuators.len(),
            });
        }
        if cfg.overrides_enabled && cfg.override_thresholds.len() != names.len() {
            return Err(ConfigError::ThresholdCount {
                want: names.len(),
                got: cfg.override_thresholds.len(),
            });
        }
        let governor = RateGovernor::new(cfg.tick_period);
        Ok(Self {
            shared,
            actuators,
            cfg,
            paused,
            stop: Arc::new(AtomicBool::new(false)),
            status: Arc::new(EngineStatus::default()),
            governor,
            names,
            current_winner: None,
            override_active: false,
            override_source: None,
            last_status_log: None,
        })
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        Arc::clone(&self.status)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn current_winner(&self) -> Option<usize> {
        self.current_winner
    }

    pub fn override_active(&self) -> bool {
        self.override_active
    }

    pub fn override_source(&self) -> Option<&str> {
        self.override_source.as_deref()
    }

    /// One decision cycle. The shared lock is held for snapshot plus
    /// decision only, never across the governor's sleep.
    pub fn tick(&mut self, now: Instant) {
        if self.paused.load(Ordering::Relaxed) {
            for actuator in &self.actuators {
                actuator.set_control(false);
            }
            self.override_active = false;
            self.override_source = None;
            self.status.set_winner(None);
            self.status.set_override(false);
            return;
        }

        let decision = {
            let sources = self.shared.lock();
            let snaps = snapshot_sources(&sources, now);
            self.decide(&snaps)
        };

        match decision {
            Decision::Winner { index, by_override } => self.apply(index, by_override, now),
            Decision::Hold => {}
            Decision::DataGap => {
                metrics::counter!("arbiter.data_gap").increment(1);
                tracing::debug!("waiting for data");
            }
        }
    }

    fn decide(&self, snaps: &[SourceSnapshot]) -> Decision {
        if snaps.len() != self.actuators.len() {
            return Decision::DataGap;
        }
        if self.cfg.overrides_enabled {
            if self.cfg.override_thresholds.len() != snaps.len() {
                return Decision::DataGap;
            }
            if let Some(index) = override_winner(
                snaps,
                &self.cfg.override_thresholds,
                self.cfg.stale_grace,
            ) {
                return Decision::Winner {
                    index,
                    by_override: true,
                };
            }
        }
        match priority_winner(
            snaps,
            self.cfg.stale_grace,
            self.cfg.stale_fallback,
            self.current_winner,
        ) {
            Some(index) => Decision::Winner {
                index,
                by_override: false,
            },
            None => Decision::Hold,
        }
    }

    fn apply(&mut self, index: usize, by_override: bool, now: Instant) {
        for (idx, actuator) in self.actuators.iter().enumerate() {
            actuator.set_control(idx == index);
        }
        self.current_winner = Some(index);
        self.override_active = by_override;
        self.override_source = by_override.then(|| self.names[index].clone());
        self.status.set_winner(Some(index));
        self.status.set_override(by_override);

        let due = self
            .last_status_log
            .is_none_or(|t| now.saturating_duration_since(t) >= Duration::from_secs(1));
        if due {
            tracing::info!(
                winner = %self.names[index],
                override_active = by_override,
                "gaze control winner"
            );
            self.last_status_log = Some(now);
        }
    }

    /// Bounded-rate loop. Blocks the calling thread until a stop request is
    /// observed; the stop flag is checked once per iteration, so an in-flight
    /// tick always completes.
    pub fn run(&mut self) {
        tracing::info!(
            period_ms = self.cfg.tick_period.as_millis() as u64,
            sources = self.names.len(),
            "arbitration loop started"
        );
        while !self.stop.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick(started);
            let sleep = self.governor.pace(Instant::now(), started.elapsed());
            self.status.set_tick_rate(self.governor.rate_estimate());
            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }
        tracing::info!("arbitration loop stopped");
    }
}

/// Paces the engine at a fixed period and keeps a rolling ticks-per-second
/// estimate, published once per window to the `arbiter.tick_rate` gauge.
#[derive(Debug)]
pub struct RateGovernor {
    period: Duration,
    window_start: Instant,
    ticks_in_window: u32,
    rate_estimate: f64,
}

impl RateGovernor {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            window_start: Instant::now(),
            ticks_in_window: 0,
            rate_estimate: 0.0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn rate_estimate(&self) -> f64 {
        self.rate_estimate
    }

    /// Accounts one finished tick and returns how long to sleep before the
    /// next. Never negative: a tick that overruns the period proceeds
    /// immediately.
    pub fn pace(&mut self, now: Instant, elapsed: Duration) -> Duration {
        self.ticks_in_window += 1;
        let window = now.saturating_duration_since(self.window_start);
        if window >= Duration::from_secs(1) {
            self.rate_estimate = f64::from(self.ticks_in_window) / window.as_secs_f64();
            metrics::gauge!("arbiter.tick_rate").set(self.rate_estimate);
            self.ticks_in_window = 0;
            self.window_start = now;
        }
        self.period.saturating_sub(elapsed)
    }
}
