//! Race lifecycle state machine.
//!
//! Transitions are validated against a closed table, serialized per race by
//! an in-flight set, and the LOCK path additionally holds a two-level global
//! guard (in-memory flag + durable reservation) so at most one race is ever
//! LOCKED or IN_PROGRESS across processes. Both guards release on every exit
//! path of the critical section.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::ChainClock;
use crate::errors::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::models::{
    now_wall_ms, Config, Currency, PhaseStamp, Race, RaceEvent, RacePhase, RaceStatus,
    SettlementEvidence, Treasury, Wager,
};
use crate::oracle::{snapshot_with_retry, PriceOracle, RunnerPicker, MIN_VETTED_FOR_REFRESH};
use crate::settlement::{PayoutRecipient, SettlementEngine};
use crate::store::Store;

pub const GLOBAL_LOCKED_PHASE_GUARD: &str = "GLOBAL_LOCKED_PHASE_GUARD";

pub fn can_transition(from: RaceStatus, to: RaceStatus) -> bool {
    use RaceStatus::*;
    matches!(
        (from, to),
        (Open, Locked)
            | (Open, Cancelled)
            | (Locked, InProgress)
            | (Locked, Cancelled)
            | (InProgress, Settled)
            | (InProgress, Cancelled)
    )
}

/// Pure expected-status oracle: where should this race be at `now`?
pub fn expected_status(
    race: &Race,
    now_ms: i64,
    treasury: &Treasury,
    another_active: bool,
    config: &Config,
) -> RaceStatus {
    let status = race.status();
    if status.is_terminal() {
        return status;
    }

    match status {
        RaceStatus::Open => {
            if now_ms - race.start_ts < config.open_ms {
                return RaceStatus::Open;
            }
            // Hard single-active invariant.
            if another_active {
                return RaceStatus::Open;
            }
            // Under maintenance only the anchor race may progress.
            if treasury.maintenance_mode
                && treasury.maintenance_anchor_race_id.as_deref() != Some(race.id.as_str())
            {
                return RaceStatus::Open;
            }
            RaceStatus::Locked
        }
        RaceStatus::Locked => {
            let locked_ts = race.phase.locked_stamp().map(|s| s.ts).unwrap_or(now_ms);
            if now_ms - locked_ts >= config.locked_to_progress_ms {
                RaceStatus::InProgress
            } else {
                RaceStatus::Locked
            }
        }
        RaceStatus::InProgress => {
            let locked_ts = race.phase.locked_stamp().map(|s| s.ts).unwrap_or(now_ms);
            if now_ms - locked_ts >= config.progress_ms {
                RaceStatus::Settled
            } else {
                RaceStatus::InProgress
            }
        }
        _ => status,
    }
}

pub struct StateMachine {
    store: Arc<dyn Store>,
    clock: Arc<ChainClock>,
    bus: EventBus,
    config: Arc<Config>,
    oracle: Arc<dyn PriceOracle>,
    picker: Arc<RunnerPicker>,
    settlement: Arc<SettlementEngine>,
    /// In-memory half of the global phase guard.
    phase_lock_in_use: AtomicBool,
    /// Per-race transition reservation.
    in_flight: Mutex<HashSet<String>>,
    /// `race_settled` emission de-dup.
    settled_emitted: Mutex<HashSet<String>>,
    /// Top-up requests to the scheduler (break of the settle->scheduler cycle).
    topup_tx: mpsc::Sender<()>,
}

impl StateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<ChainClock>,
        bus: EventBus,
        config: Arc<Config>,
        oracle: Arc<dyn PriceOracle>,
        picker: Arc<RunnerPicker>,
        settlement: Arc<SettlementEngine>,
        topup_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            store,
            clock,
            bus,
            config,
            oracle,
            picker,
            settlement,
            phase_lock_in_use: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            settled_emitted: Mutex::new(HashSet::new()),
            topup_tx,
        }
    }

    /// Expected status for a race, pulling the global context it needs.
    pub async fn expected_status_for(&self, race: &Race) -> EngineResult<RaceStatus> {
        let treasury = self.store.treasury().await?;
        let another_active = self.another_active(&race.id).await?;
        Ok(expected_status(
            race,
            self.clock.now_ms(),
            &treasury,
            another_active,
            &self.config,
        ))
    }

    async fn another_active(&self, except_race: &str) -> EngineResult<bool> {
        for status in [RaceStatus::Locked, RaceStatus::InProgress] {
            if self
                .store
                .races_by_status(status)
                .await?
                .iter()
                .any(|r| r.id != except_race)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drive a race to `target`. A transition already being applied by
    /// another caller, or already applied, returns the freshest state.
    pub async fn transition(
        &self,
        race_id: &str,
        target: RaceStatus,
        reason: &str,
    ) -> EngineResult<Race> {
        let already_in_flight = {
            let mut in_flight = self.in_flight.lock();
            !in_flight.insert(race_id.to_string())
        };
        if already_in_flight {
            return self
                .store
                .race(race_id)
                .await?
                .ok_or_else(|| EngineError::RaceNotFound(race_id.to_string()));
        }

        let result = self.transition_inner(race_id, target, reason).await;
        self.in_flight.lock().remove(race_id);
        result
    }

    async fn transition_inner(
        &self,
        race_id: &str,
        target: RaceStatus,
        reason: &str,
    ) -> EngineResult<Race> {
        let race = self
            .store
            .race(race_id)
            .await?
            .ok_or_else(|| EngineError::RaceNotFound(race_id.to_string()))?;

        if race.status() == target {
            return Ok(race);
        }
        if !can_transition(race.status(), target) {
            return Err(EngineError::InvalidTransition {
                from: race.status(),
                to: target,
            });
        }

        info!(race_id, from = %race.status(), to = %target, reason, "transition");

        match target {
            RaceStatus::Locked => self.apply_lock(race).await,
            RaceStatus::InProgress => self.apply_in_progress(race).await,
            RaceStatus::Settled => self.apply_settle(race).await,
            RaceStatus::Cancelled => self.apply_cancel(race, reason).await,
            RaceStatus::Open => Err(EngineError::InvalidTransition {
                from: race.status(),
                to: target,
            }),
        }
    }

    fn stamp_now(&self) -> PhaseStamp {
        let snap = self.clock.snapshot();
        PhaseStamp {
            ts: self.clock.now_ms(),
            slot: (snap.last_slot > 0).then_some(snap.last_slot),
            block_time_ms: (snap.last_block_time_ms > 0).then_some(snap.last_block_time_ms),
        }
    }

    fn emit(&self, event: RaceEvent) {
        if let RaceEvent::RaceSettled { race } = &event {
            let mut emitted = self.settled_emitted.lock();
            if !emitted.insert(race.id.clone()) {
                return;
            }
        }
        self.bus.publish(event);
    }

    // ------------------------------------------------------------- LOCK ----

    async fn apply_lock(&self, race: Race) -> EngineResult<Race> {
        // Two-level guard: in-memory flag first, then the durable reservation
        // that also excludes other processes.
        if self
            .phase_lock_in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::LockBlocked("phase lock in use".into()));
        }

        let durable_held = match self.store.reserve(GLOBAL_LOCKED_PHASE_GUARD).await {
            Ok(held) => held,
            Err(e) => {
                self.phase_lock_in_use.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if !durable_held {
            self.phase_lock_in_use.store(false, Ordering::SeqCst);
            return Err(EngineError::LockBlocked(
                "global phase guard reserved elsewhere".into(),
            ));
        }

        let result = self.lock_critical(race).await;

        // Release both guards on every exit path.
        if let Err(e) = self.store.release(GLOBAL_LOCKED_PHASE_GUARD).await {
            warn!(error = %e, "failed to release durable phase guard");
        }
        self.phase_lock_in_use.store(false, Ordering::SeqCst);

        result
    }

    async fn lock_critical(&self, race: Race) -> EngineResult<Race> {
        // Re-read under the guard; a racing scheduler may have progressed it.
        let mut race = self
            .store
            .race(&race.id)
            .await?
            .ok_or_else(|| EngineError::RaceNotFound(race.id.clone()))?;
        if race.status() != RaceStatus::Open {
            return Ok(race);
        }

        if self.another_active(&race.id).await? {
            return Err(EngineError::LockBlocked(
                "another race holds the active window".into(),
            ));
        }

        let treasury = self.store.treasury().await?;
        if treasury.maintenance_mode
            && treasury.maintenance_anchor_race_id.as_deref() != Some(race.id.as_str())
        {
            return Err(EngineError::MaintenanceBlocked(
                "maintenance mode: only the anchor race may lock".into(),
            ));
        }

        // Deferred runner selection: placeholders refresh at LOCK.
        let placeholders = race.runners.len() < crate::oracle::MIN_RUNNERS
            || race.runners.iter().any(|r| !r.is_vetted());
        if placeholders {
            match self.picker.pick(MIN_VETTED_FOR_REFRESH).await {
                Ok(runners) => race.runners = runners,
                Err(e) => {
                    // Advancing with placeholders beats stalling the lifecycle.
                    warn!(race_id = %race.id, error = %e, "runner refresh failed, keeping placeholders");
                }
            }
        }

        // Baseline capture; missing quotes fall back through current price,
        // then initial price, then zero.
        let quotes = snapshot_with_retry(self.oracle.as_ref(), &race.runners).await;
        let now = self.clock.now_ms();
        for runner in &mut race.runners {
            let baseline = quotes
                .get(&runner.mint)
                .copied()
                .filter(|p| *p > 0.0)
                .or_else(|| (runner.current_price > 0.0).then_some(runner.current_price))
                .or_else(|| (runner.initial_price > 0.0).then_some(runner.initial_price))
                .unwrap_or(0.0);
            runner.initial_price = baseline;
            runner.initial_price_usd = baseline;
            runner.current_price = baseline;
            runner.price_change = 0.0;
            runner.initial_price_ts = Some(now);
        }

        race.phase = RacePhase::Locked {
            locked: self.stamp_now(),
        };
        self.store.update_race(&race).await?;

        self.seed_house_bets(&race).await;

        self.emit(RaceEvent::RaceLocked { race: race.clone() });
        Ok(race)
    }

    /// Micro-wagers on every runner so odds and UI are populated from the
    /// start. Attribution is the escrow wallet: retained winnings stay in
    /// escrow. Stable synthetic signatures make re-seeding a no-op.
    async fn seed_house_bets(&self, race: &Race) {
        let mut currencies = vec![Currency::Sol];
        if self.config.enable_race_bets {
            currencies.push(Currency::Race);
        }

        let now = self.clock.now_ms();
        for currency in currencies {
            let amount = self.config.house_seed(currency);
            if amount <= Decimal::ZERO {
                continue;
            }
            for i in 0..race.runners.len() {
                let sig = format!("seed_{currency}_{}_{i}", race.id);
                let wager = Wager {
                    id: sig.clone(),
                    race_id: race.id.clone(),
                    wallet: self.config.escrow_wallet.clone(),
                    runner_idx: i,
                    amount,
                    currency,
                    sig,
                    ts: now,
                    block_time_ms: None,
                    slot: None,
                    client_id: None,
                    memo: None,
                };
                if let Err(e) = self.store.hydrate_wager(&wager).await {
                    warn!(race_id = %race.id, error = %e, "house seed failed");
                }
            }
        }
    }

    // ------------------------------------------------------ IN_PROGRESS ----

    async fn apply_in_progress(&self, race: Race) -> EngineResult<Race> {
        let mut race = race;
        let locked = match race.phase.locked_stamp().copied() {
            Some(stamp) => stamp,
            // Crash recovery: synthesize the locked stamp.
            None => PhaseStamp::at(self.clock.now_ms() - self.config.locked_to_progress_ms),
        };
        race.phase = RacePhase::InProgress {
            locked,
            in_progress: self.stamp_now(),
        };
        self.store.update_race(&race).await?;
        self.emit(RaceEvent::RaceLive { race: race.clone() });
        Ok(race)
    }

    // ----------------------------------------------------------- SETTLE ----

    async fn apply_settle(&self, race: Race) -> EngineResult<Race> {
        if self.config.block_settlements {
            return Err(EngineError::MaintenanceBlocked(
                "settlements are blocked".into(),
            ));
        }

        let settle_key = format!("settlement_{}", race.id);
        if !self.store.reserve(&settle_key).await? {
            // Either already settled (skip) or a prior attempt crashed
            // mid-way; the compute below is deterministic and every side
            // effect is reservation-guarded, so finishing is safe.
            let fresh = self
                .store
                .race(&race.id)
                .await?
                .ok_or_else(|| EngineError::RaceNotFound(race.id.clone()))?;
            if fresh.status() == RaceStatus::Settled {
                return Ok(fresh);
            }
            debug!(race_id = %race.id, "settlement reservation held, resuming interrupted settle");
        }

        let mut race = race;
        let locked = race
            .phase
            .locked_stamp()
            .copied()
            .unwrap_or(PhaseStamp::at(race.start_ts));
        let in_progress = race
            .phase
            .in_progress_stamp()
            .copied()
            .unwrap_or(locked);

        let start_ms = locked.block_time_ms.unwrap_or(locked.ts);
        let end_ms = self
            .clock
            .last_block_time_ms()
            .unwrap_or_else(|| self.clock.now_ms());
        let duration_minutes = (((end_ms - start_ms).max(0) as f64) / 60_000.0).ceil().max(1.0) as u32;

        // Per-runner price change over the window.
        let mut changes: Vec<f64> = Vec::with_capacity(race.runners.len());
        let mut any_fallback = false;
        for runner in &mut race.runners {
            let change = match self
                .oracle
                .ohlcv(
                    &runner.mint,
                    start_ms,
                    duration_minutes,
                    Some(runner.pool_address.as_str()).filter(|p| !p.is_empty()),
                )
                .await
            {
                Ok(candles) => {
                    let open = candles
                        .iter()
                        .find(|c| c.t >= start_ms)
                        .map(|c| c.open)
                        .filter(|o| *o > 0.0);
                    let close = candles
                        .iter()
                        .rev()
                        .find(|c| c.t <= end_ms)
                        .map(|c| c.close);
                    match (open, close) {
                        (Some(open), Some(close)) => {
                            runner.current_price = close;
                            (close - open) / open * 100.0
                        }
                        _ => {
                            any_fallback = true;
                            runner.price_change
                        }
                    }
                }
                Err(e) => {
                    warn!(race_id = %race.id, mint = %runner.mint, error = %e, "ohlcv failed, using fallback change");
                    any_fallback = true;
                    runner.price_change
                }
            };
            runner.price_change = change;
            changes.push(change);
        }

        // Deterministic argmax: strict greater keeps the lowest index on ties.
        let winner_index = changes
            .iter()
            .enumerate()
            .fold(0usize, |best, (i, change)| {
                if *change > changes[best] {
                    i
                } else {
                    best
                }
            });
        let gain = changes.get(winner_index).copied().unwrap_or(0.0);

        let signature = format!(
            "price_based_{winner_index}_{gain:.4}{}",
            if any_fallback { "_fallback" } else { "" }
        );
        let randomness =
            serde_json::to_string(&changes).unwrap_or_else(|_| "[]".to_string());

        race.phase = RacePhase::Settled {
            locked,
            in_progress,
            settled: self.stamp_now(),
            winner_index,
            evidence: SettlementEvidence {
                drand_round: None,
                randomness,
                signature,
            },
            jackpot_added_sol: Decimal::ZERO,
            jackpot_added_race: Decimal::ZERO,
        };
        self.store.update_race(&race).await?;

        if let Err(e) = self.store.add_recent_winner(&race).await {
            warn!(race_id = %race.id, error = %e, "recent winner record failed");
        }
        let _ = self.store.cleanup_recent_winners(6).await;

        self.emit(RaceEvent::RaceSettled { race: race.clone() });

        let race = match self.settlement.execute(&race).await {
            Ok(updated) => updated,
            Err(e) => {
                // Payout retry loops own recovery; the race itself is settled.
                warn!(race_id = %race.id, error = %e, "settlement execution incomplete");
                race
            }
        };

        // Keep the OPEN pool topped up.
        let _ = self.topup_tx.try_send(());

        Ok(race)
    }

    // ----------------------------------------------------------- CANCEL ----

    async fn apply_cancel(&self, race: Race, reason: &str) -> EngineResult<Race> {
        let mut race = race;
        let locked = race.phase.locked_stamp().copied();
        let in_progress = race.phase.in_progress_stamp().copied();

        race.phase = RacePhase::Cancelled {
            locked,
            in_progress,
            cancelled_ts: self.clock.now_ms(),
            reason: reason.to_string(),
        };
        // CANCELLED persists before refunds: if transfers cannot execute the
        // system still recovers.
        self.store.update_race(&race).await?;

        if let Err(e) = self.refund_all(&race).await {
            warn!(race_id = %race.id, error = %e, "cancel refunds incomplete");
        }

        self.emit(RaceEvent::RaceCancelled { race: race.clone() });
        Ok(race)
    }

    async fn refund_all(&self, race: &Race) -> EngineResult<()> {
        let wagers = self.store.wagers_by_race(&race.id).await?;
        let treasury = self.store.treasury().await?;

        for currency in Currency::ALL {
            let mut order: Vec<String> = Vec::new();
            let mut totals: std::collections::HashMap<String, Decimal> = Default::default();
            for w in wagers.iter().filter(|w| w.currency == currency) {
                if self.config.is_house_wallet(&w.wallet) {
                    continue;
                }
                if !totals.contains_key(&w.wallet) {
                    order.push(w.wallet.clone());
                }
                *totals.entry(w.wallet.clone()).or_insert(Decimal::ZERO) += w.amount;
            }
            if order.is_empty() {
                continue;
            }

            let recipients: Vec<PayoutRecipient> = order
                .into_iter()
                .map(|wallet| {
                    let amount = totals[&wallet];
                    PayoutRecipient {
                        wallet,
                        amount,
                        refund: true,
                    }
                })
                .collect();

            let mint = match currency {
                Currency::Sol => None,
                Currency::Race => treasury.race_mint.clone(),
            };
            if currency == Currency::Race && mint.is_none() {
                continue;
            }

            self.settlement
                .payout_executor()
                .execute(&race.id, currency, mint.as_deref(), &recipients)
                .await?;
        }
        Ok(())
    }
}
