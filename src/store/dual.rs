//! Dual store: hot cache in front of the durable backend.
//!
//! Reads of display state prefer the cache and fall back to the durable
//! store. Display writes apply to the cache synchronously and mirror to the
//! durable store through a bounded replication queue drained by a background
//! worker; a full queue drops the task and counts it. Idempotency-bearing
//! writes (reservations, wagers, treasury deltas, settlement rows, referral
//! queue) go to the durable store synchronously — those must survive a crash
//! — and refresh the cache afterwards.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::EngineResult;
use crate::models::{
    Currency, Race, RaceStatus, RecentWinner, ReferralAttribution, ReferralReward,
    ReferralSettings, SettlementError, SettlementTransfer, TransferStatus, Treasury,
    UserRaceResult, UserStats, Wager,
};

use super::{CacheStore, Store, TransferUpdate, WagerAggregate};

const REPLICATION_QUEUE_CAP: usize = 1024;

enum ReplTask {
    UpsertRace(Race),
    Treasury(Treasury),
    RecentWinner(Race),
    UserResult(UserRaceResult),
    RecalcStats(String),
    CleanupWinners(usize),
}

pub struct DualStore {
    durable: Arc<dyn Store>,
    cache: Arc<CacheStore>,
    repl_tx: mpsc::Sender<ReplTask>,
    dropped: AtomicU64,
}

impl DualStore {
    pub fn new(durable: Arc<dyn Store>) -> Self {
        let cache = Arc::new(CacheStore::new());
        let (repl_tx, repl_rx) = mpsc::channel(REPLICATION_QUEUE_CAP);

        tokio::spawn(Self::run_replication(durable.clone(), repl_rx));
        tokio::spawn(Self::warm(durable.clone(), cache.clone()));

        Self {
            durable,
            cache,
            repl_tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Mirror tasks dropped because the queue was full.
    pub fn dropped_replications(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn mirror(&self, task: ReplTask) {
        if self.repl_tx.try_send(task).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "replication queue full, mirror task dropped");
        }
    }

    async fn run_replication(durable: Arc<dyn Store>, mut rx: mpsc::Receiver<ReplTask>) {
        while let Some(task) = rx.recv().await {
            let result = match task {
                ReplTask::UpsertRace(race) => match durable.update_race(&race).await {
                    Err(crate::errors::EngineError::RaceNotFound(_)) => {
                        durable.create_race(&race).await
                    }
                    other => other,
                },
                ReplTask::Treasury(t) => durable.update_treasury(&t).await,
                ReplTask::RecentWinner(race) => durable.add_recent_winner(&race).await,
                ReplTask::UserResult(r) => durable.upsert_user_race_result(&r).await,
                ReplTask::RecalcStats(wallet) => {
                    durable.recalc_user_stats(&wallet).await.map(|_| ())
                }
                ReplTask::CleanupWinners(keep) => {
                    durable.cleanup_recent_winners(keep).await.map(|_| ())
                }
            };
            if let Err(e) = result {
                // Mirror failures never reach the caller.
                warn!(error = %e, "replication mirror write failed");
            }
        }
    }

    /// Rebuild the hot cache from the durable store at startup.
    async fn warm(durable: Arc<dyn Store>, cache: Arc<CacheStore>) {
        match durable.all_races().await {
            Ok(races) => {
                for race in &races {
                    if cache.update_race(race).await.is_err() {
                        let _ = cache.create_race(race).await;
                    }
                }
                debug!(count = races.len(), "cache warmed with races");
            }
            Err(e) => warn!(error = %e, "cache warm failed reading races"),
        }
        if let Ok(t) = durable.treasury().await {
            let _ = cache.update_treasury(&t).await;
        }
        if let Ok(winners) = durable.recent_winners(16).await {
            debug!(count = winners.len(), "recent winners present in durable store");
        }
    }

    async fn cache_upsert_race(&self, race: &Race) {
        if self.cache.update_race(race).await.is_err() {
            let _ = self.cache.create_race(race).await;
        }
    }
}

#[async_trait]
impl Store for DualStore {
    async fn create_race(&self, race: &Race) -> EngineResult<()> {
        self.cache.create_race(race).await?;
        self.mirror(ReplTask::UpsertRace(race.clone()));
        Ok(())
    }

    async fn race(&self, id: &str) -> EngineResult<Option<Race>> {
        if let Some(race) = self.cache.race(id).await? {
            return Ok(Some(race));
        }
        let race = self.durable.race(id).await?;
        if let Some(race) = &race {
            self.cache_upsert_race(race).await;
        }
        Ok(race)
    }

    async fn races_by_status(&self, status: RaceStatus) -> EngineResult<Vec<Race>> {
        self.cache.races_by_status(status).await
    }

    async fn all_races(&self) -> EngineResult<Vec<Race>> {
        self.cache.all_races().await
    }

    async fn update_race(&self, race: &Race) -> EngineResult<()> {
        self.cache_upsert_race(race).await;
        self.mirror(ReplTask::UpsertRace(race.clone()));
        Ok(())
    }

    // Wagers are money state: durable first, cache follows synchronously.
    async fn create_wager(&self, wager: &Wager) -> EngineResult<()> {
        self.durable.create_wager(wager).await?;
        let _ = self.cache.hydrate_wager(wager).await;
        Ok(())
    }

    async fn hydrate_wager(&self, wager: &Wager) -> EngineResult<bool> {
        let inserted = self.durable.hydrate_wager(wager).await?;
        let _ = self.cache.hydrate_wager(wager).await;
        Ok(inserted)
    }

    async fn wagers_by_race(&self, race_id: &str) -> EngineResult<Vec<Wager>> {
        self.durable.wagers_by_race(race_id).await
    }

    async fn wagers_by_wallet(
        &self,
        wallet: &str,
        race_id: Option<&str>,
    ) -> EngineResult<Vec<Wager>> {
        self.durable.wagers_by_wallet(wallet, race_id).await
    }

    async fn wager_aggregates_by_race(&self, race_id: &str) -> EngineResult<Vec<WagerAggregate>> {
        self.cache.wager_aggregates_by_race(race_id).await
    }

    async fn treasury(&self) -> EngineResult<Treasury> {
        self.cache.treasury().await
    }

    async fn update_treasury(&self, treasury: &Treasury) -> EngineResult<()> {
        self.cache.update_treasury(treasury).await?;
        self.mirror(ReplTask::Treasury(treasury.clone()));
        Ok(())
    }

    async fn adjust_jackpot_balances(
        &self,
        delta_race: Decimal,
        delta_sol: Decimal,
    ) -> EngineResult<(Decimal, Decimal)> {
        // Serialized by the durable row lock; cache takes the result, not the
        // delta, so the two never diverge by double-apply.
        let (race, sol) = self
            .durable
            .adjust_jackpot_balances(delta_race, delta_sol)
            .await?;
        let mut t = self.cache.treasury().await?;
        t.jackpot_balance_race = race;
        t.jackpot_balance_sol = sol;
        self.cache.update_treasury(&t).await?;
        Ok((race, sol))
    }

    async fn has_seen(&self, sig: &str) -> EngineResult<bool> {
        self.durable.has_seen(sig).await
    }

    async fn record_seen(&self, sig: &str) -> EngineResult<()> {
        self.durable.record_seen(sig).await
    }

    async fn reserve(&self, sig: &str) -> EngineResult<bool> {
        self.durable.reserve(sig).await
    }

    async fn release(&self, sig: &str) -> EngineResult<()> {
        self.durable.release(sig).await
    }

    async fn cleanup_seen(&self, older_than_ms: i64) -> EngineResult<u64> {
        self.durable.cleanup_seen(older_than_ms).await
    }

    async fn record_transfer(&self, transfer: &SettlementTransfer) -> EngineResult<()> {
        self.durable.record_transfer(transfer).await
    }

    async fn transfers_by_race(&self, race_id: &str) -> EngineResult<Vec<SettlementTransfer>> {
        self.durable.transfers_by_race(race_id).await
    }

    async fn transfers_by_wallet(
        &self,
        wallet: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>> {
        self.durable.transfers_by_wallet(wallet, limit).await
    }

    async fn transfer_for_race_and_wallet(
        &self,
        race_id: &str,
        wallet: &str,
        currency: Currency,
    ) -> EngineResult<Option<SettlementTransfer>> {
        self.durable
            .transfer_for_race_and_wallet(race_id, wallet, currency)
            .await
    }

    async fn update_transfer_status(
        &self,
        id: &str,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> EngineResult<()> {
        self.durable.update_transfer_status(id, status, update).await
    }

    async fn failed_or_pending_transfers(
        &self,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>> {
        self.durable.failed_or_pending_transfers(limit).await
    }

    async fn record_settlement_error(&self, error: &SettlementError) -> EngineResult<()> {
        self.durable.record_settlement_error(error).await
    }

    async fn settlement_errors_by_race(
        &self,
        race_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementError>> {
        self.durable.settlement_errors_by_race(race_id, limit).await
    }

    async fn recent_settlement_errors(&self, limit: usize) -> EngineResult<Vec<SettlementError>> {
        self.durable.recent_settlement_errors(limit).await
    }

    async fn upsert_user_race_result(&self, result: &UserRaceResult) -> EngineResult<()> {
        self.cache.upsert_user_race_result(result).await?;
        self.mirror(ReplTask::UserResult(result.clone()));
        Ok(())
    }

    async fn recalc_user_stats(&self, wallet: &str) -> EngineResult<UserStats> {
        let stats = self.cache.recalc_user_stats(wallet).await?;
        self.mirror(ReplTask::RecalcStats(wallet.to_string()));
        Ok(stats)
    }

    async fn leaderboard(&self, limit: usize) -> EngineResult<Vec<UserStats>> {
        self.cache.leaderboard(limit).await
    }

    async fn user_rank(&self, wallet: &str) -> EngineResult<Option<u64>> {
        self.cache.user_rank(wallet).await
    }

    async fn rebuild_stale_projections(&self) -> EngineResult<bool> {
        let cache_changed = self.cache.rebuild_stale_projections().await?;
        let durable_changed = self.durable.rebuild_stale_projections().await?;
        Ok(cache_changed || durable_changed)
    }

    async fn add_recent_winner(&self, race: &Race) -> EngineResult<()> {
        self.cache.add_recent_winner(race).await?;
        self.mirror(ReplTask::RecentWinner(race.clone()));
        Ok(())
    }

    async fn recent_winners(&self, limit: usize) -> EngineResult<Vec<RecentWinner>> {
        self.cache.recent_winners(limit).await
    }

    async fn cleanup_recent_winners(&self, keep: usize) -> EngineResult<u64> {
        let removed = self.cache.cleanup_recent_winners(keep).await?;
        self.mirror(ReplTask::CleanupWinners(keep));
        Ok(removed)
    }

    async fn referral_settings(&self) -> EngineResult<ReferralSettings> {
        self.durable.referral_settings().await
    }

    async fn register_referral_code(&self, wallet: &str, code: &str) -> EngineResult<()> {
        self.durable.register_referral_code(wallet, code).await
    }

    async fn wallet_for_code(&self, code: &str) -> EngineResult<Option<String>> {
        self.durable.wallet_for_code(code).await
    }

    async fn attribution_for(&self, wallet: &str) -> EngineResult<Option<ReferralAttribution>> {
        self.durable.attribution_for(wallet).await
    }

    async fn attribute_wallet(
        &self,
        wallet: &str,
        code: &str,
        referrer: &str,
        now_ms: i64,
    ) -> EngineResult<bool> {
        self.durable
            .attribute_wallet(wallet, code, referrer, now_ms)
            .await
    }

    async fn enqueue_referral_reward(&self, reward: &ReferralReward) -> EngineResult<bool> {
        self.durable.enqueue_referral_reward(reward).await
    }

    async fn queued_referral_rewards(&self, limit: usize) -> EngineResult<Vec<ReferralReward>> {
        self.durable.queued_referral_rewards(limit).await
    }

    async fn mark_rewards_paid(&self, ids: &[String]) -> EngineResult<()> {
        self.durable.mark_rewards_paid(ids).await
    }
}
