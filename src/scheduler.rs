//! Scheduling: per-race timers, OPEN-pool top-up, health reconciliation, and
//! the live countdown / price-tick loops.
//!
//! Timers aim at the absolute drift-corrected timestamp of the next expected
//! transition and re-derive it after every attempt, so a re-armed process
//! picks up exactly where the previous one stopped. The health checker is the
//! safety net for anything a timer misses; after the per-race retry budget it
//! forces cancellation so no race ever wedges the active window.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::ChainClock;
use crate::errors::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::models::{Config, Race, RaceEvent, RacePhase, RaceStatus};
use crate::oracle::{PriceOracle, RunnerPicker, SnapshotPriority, MIN_RUNNERS};
use crate::state_machine::StateMachine;
use crate::store::Store;

/// Lead time before a freshly created race opens for wagering.
const CREATION_LEAD_MS: i64 = 3 * 60_000;
/// A LOCKED race older than this is stuck regardless of other signals.
const LOCKED_STUCK_MS: i64 = 10_000;
const TIMER_RETRY_MS: u64 = 5_000;

pub struct Scheduler {
    store: Arc<dyn Store>,
    clock: Arc<ChainClock>,
    config: Arc<Config>,
    sm: Arc<StateMachine>,
    picker: Arc<RunnerPicker>,
    oracle: Arc<dyn PriceOracle>,
    bus: EventBus,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    retry_attempts: Mutex<HashMap<String, u32>>,
}

/// Absolute target timestamp and the status a race should reach there.
pub fn next_target(race: &Race, config: &Config) -> Option<(i64, RaceStatus)> {
    match race.status() {
        RaceStatus::Open => Some((race.start_ts + config.open_ms, RaceStatus::Locked)),
        RaceStatus::Locked => race
            .phase
            .locked_stamp()
            .map(|s| (s.ts + config.locked_to_progress_ms, RaceStatus::InProgress)),
        RaceStatus::InProgress => race
            .phase
            .locked_stamp()
            .map(|s| (s.ts + config.progress_ms, RaceStatus::Settled)),
        _ => None,
    }
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<ChainClock>,
        config: Arc<Config>,
        sm: Arc<StateMachine>,
        picker: Arc<RunnerPicker>,
        oracle: Arc<dyn PriceOracle>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            sm,
            picker,
            oracle,
            bus,
            timers: Mutex::new(HashMap::new()),
            retry_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Arm timers for every live race and spawn the periodic loops.
    pub async fn start(self: &Arc<Self>, mut topup_rx: mpsc::Receiver<()>) -> EngineResult<()> {
        for status in [RaceStatus::Open, RaceStatus::Locked, RaceStatus::InProgress] {
            for race in self.store.races_by_status(status).await? {
                self.arm_timer(&race.id);
            }
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(scheduler.config.topup_interval_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    received = topup_rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                    }
                }
                if let Err(e) = scheduler.ensure_topup().await {
                    warn!(error = %e, "top-up pass failed");
                }
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(scheduler.config.health_interval_ms));
            loop {
                interval.tick().await;
                scheduler.health_check().await;
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                scheduler.config.countdown_interval_ms,
            ));
            loop {
                interval.tick().await;
                scheduler.countdown_tick().await;
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(scheduler.config.tick_interval_ms));
            loop {
                interval.tick().await;
                scheduler.price_tick().await;
            }
        });

        Ok(())
    }

    /// One timer task per live race; re-arming replaces the previous task.
    pub fn arm_timer(self: &Arc<Self>, race_id: &str) {
        let scheduler = self.clone();
        let id = race_id.to_string();
        let handle = tokio::spawn(async move {
            scheduler.clone().race_timer(&id).await;
            scheduler.timers.lock().remove(&id);
        });
        if let Some(old) = self.timers.lock().insert(race_id.to_string(), handle) {
            old.abort();
        }
    }

    async fn race_timer(self: Arc<Self>, race_id: &str) {
        loop {
            let race = match self.store.race(race_id).await {
                Ok(Some(race)) => race,
                Ok(None) => return,
                Err(e) => {
                    warn!(race_id, error = %e, "timer read failed");
                    tokio::time::sleep(Duration::from_millis(TIMER_RETRY_MS)).await;
                    continue;
                }
            };
            if race.is_terminal() {
                return;
            }

            let Some((target_ts, target)) = next_target(&race, &self.config) else {
                return;
            };
            let delay = target_ts - self.clock.now_ms();
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }

            match self.sm.transition(race_id, target, "timer").await {
                Ok(_) => continue,
                Err(EngineError::LockBlocked(_)) | Err(EngineError::MaintenanceBlocked(_)) => {
                    // Another race holds the window or maintenance is on;
                    // check again shortly.
                    tokio::time::sleep(Duration::from_millis(TIMER_RETRY_MS)).await;
                }
                Err(e) => {
                    warn!(race_id, to = %target, error = %e, "timer transition failed");
                    tokio::time::sleep(Duration::from_millis(TIMER_RETRY_MS)).await;
                }
            }
        }
    }

    /// Keep the OPEN pool at the configured target.
    pub async fn ensure_topup(self: &Arc<Self>) -> EngineResult<()> {
        if self.config.block_new_races {
            return Ok(());
        }
        let treasury = self.store.treasury().await?;
        if treasury.maintenance_mode {
            return Ok(());
        }

        let open = self.store.races_by_status(RaceStatus::Open).await?;
        if open.len() >= self.config.topup_target {
            return Ok(());
        }

        let now = self.clock.now_ms();
        let mut last_start = open.iter().map(|r| r.start_ts).max().unwrap_or(i64::MIN);

        for _ in open.len()..self.config.topup_target {
            // Spacing: at least the creation lead from now, and a full OPEN
            // window after the previous race.
            let start_ts = (now + CREATION_LEAD_MS).max(last_start + self.config.open_ms);
            match self.create_race(start_ts).await {
                Ok(race) => {
                    last_start = race.start_ts;
                    self.arm_timer(&race.id);
                }
                Err(e) => {
                    warn!(error = %e, "race creation failed");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn create_race(&self, start_ts: i64) -> EngineResult<Race> {
        let runners = self.picker.pick(MIN_RUNNERS).await?;

        let jackpot_flag = self.config.jackpot_enabled
            && rand::thread_rng().gen_bool((self.config.jackpot_prob_pct / 100.0).clamp(0.0, 1.0));

        let race = Race {
            id: format!("race_{}", uuid::Uuid::new_v4()),
            start_ts,
            rake_bps: 500,
            jackpot_flag,
            runners,
            phase: RacePhase::Open,
            created_at: self.clock.now_ms(),
        };
        self.store.create_race(&race).await?;
        info!(
            race_id = %race.id,
            start_ts,
            jackpot = jackpot_flag,
            runners = race.runners.len(),
            "race created"
        );
        self.bus.publish(RaceEvent::RaceCreated { race: race.clone() });
        Ok(race)
    }

    /// Where a timer or a crash left a race behind, push it forward; after
    /// the retry budget, cancel with `max_retries_exceeded`.
    pub async fn health_check(&self) {
        let mut live: Vec<Race> = Vec::new();
        for status in [RaceStatus::Open, RaceStatus::Locked, RaceStatus::InProgress] {
            match self.store.races_by_status(status).await {
                Ok(mut races) => live.append(&mut races),
                Err(e) => {
                    warn!(error = %e, "health check read failed");
                    return;
                }
            }
        }

        let now = self.clock.now_ms();
        for race in live {
            let expected = match self.sm.expected_status_for(&race).await {
                Ok(expected) => expected,
                Err(e) => {
                    warn!(race_id = %race.id, error = %e, "expected status failed");
                    continue;
                }
            };

            let current = race.status();
            if expected == current && !self.is_stuck(&race, now) {
                self.retry_attempts.lock().remove(&race.id);
                continue;
            }

            let overdue = next_target(&race, &self.config)
                .map(|(target_ts, _)| now - target_ts)
                .unwrap_or(0);
            if expected != current && overdue < self.config.transition_grace_ms {
                continue;
            }

            let attempts = {
                let mut attempts = self.retry_attempts.lock();
                let n = attempts.entry(race.id.clone()).or_insert(0);
                *n += 1;
                *n
            };

            if attempts > self.config.max_retries {
                warn!(race_id = %race.id, attempts, "retry budget exhausted, cancelling");
                if let Err(e) = self
                    .sm
                    .transition(&race.id, RaceStatus::Cancelled, "max_retries_exceeded")
                    .await
                {
                    warn!(race_id = %race.id, error = %e, "forced cancel failed");
                }
                self.retry_attempts.lock().remove(&race.id);
                continue;
            }

            let target = if expected != current { expected } else {
                match next_target(&race, &self.config) {
                    Some((_, target)) => target,
                    None => continue,
                }
            };

            debug!(race_id = %race.id, from = %current, to = %target, attempts, "health recovery");
            match self.sm.transition(&race.id, target, "health_check").await {
                Ok(_) => {
                    self.retry_attempts.lock().remove(&race.id);
                }
                Err(e) => {
                    warn!(race_id = %race.id, error = %e, "health recovery failed");
                }
            }
        }
    }

    /// Stuck-state taxonomy beyond the expected-status delta.
    fn is_stuck(&self, race: &Race, now_ms: i64) -> bool {
        match race.status() {
            RaceStatus::Locked => race
                .phase
                .locked_stamp()
                .map(|s| now_ms - s.ts > LOCKED_STUCK_MS)
                .unwrap_or(true),
            RaceStatus::InProgress => race
                .phase
                .locked_stamp()
                .map(|s| {
                    now_ms - s.ts > self.config.progress_ms + self.config.transition_grace_ms
                })
                .unwrap_or(true),
            _ => false,
        }
    }

    /// Publish the absolute target of the next transition for every live
    /// race; clients render countdowns without clock jitter.
    async fn countdown_tick(&self) {
        for status in [RaceStatus::Open, RaceStatus::Locked, RaceStatus::InProgress] {
            let races = match self.store.races_by_status(status).await {
                Ok(races) => races,
                Err(_) => continue,
            };
            let now = self.clock.now_ms();
            for race in races {
                if let Some((target_ts, _)) = next_target(&race, &self.config) {
                    self.bus.publish(RaceEvent::CountdownUpdate {
                        race_id: race.id.clone(),
                        status: race.status(),
                        target_ts,
                        remaining_ms: (target_ts - now).max(0),
                    });
                }
            }
        }
    }

    /// Refresh live prices for the active race and publish the update.
    async fn price_tick(&self) {
        for status in [RaceStatus::Locked, RaceStatus::InProgress] {
            let races = match self.store.races_by_status(status).await {
                Ok(races) => races,
                Err(_) => continue,
            };
            for mut race in races {
                let quotes = match self
                    .oracle
                    .snapshot(&race.runners, false, SnapshotPriority::Normal)
                    .await
                {
                    Ok(quotes) => quotes,
                    Err(e) => {
                        debug!(race_id = %race.id, error = %e, "price tick skipped");
                        continue;
                    }
                };
                let by_mint: HashMap<&str, f64> = quotes
                    .iter()
                    .map(|q| (q.mint.as_str(), q.price))
                    .collect();

                let mut changed = false;
                for runner in &mut race.runners {
                    if let Some(price) = by_mint.get(runner.mint.as_str()).copied() {
                        if price > 0.0 {
                            runner.current_price = price;
                            if runner.initial_price > 0.0 {
                                runner.price_change =
                                    (price - runner.initial_price) / runner.initial_price * 100.0;
                            }
                            changed = true;
                        }
                    }
                }
                if !changed {
                    continue;
                }
                if let Err(e) = self.store.update_race(&race).await {
                    warn!(race_id = %race.id, error = %e, "price tick persist failed");
                    continue;
                }
                self.bus.publish(RaceEvent::RaceUpdated { race });
            }
        }
    }
}
