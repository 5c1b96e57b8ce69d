//! Persistence: one contract, three backends.
//!
//! `SqliteStore` is the authoritative durable backend. `CacheStore` holds the
//! same contract in memory and can always be rebuilt. `DualStore` fronts the
//! durable store with the cache, mirroring plain writes through a bounded
//! replication queue.

pub mod cache;
pub mod dual;
pub mod sqlite;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use crate::errors::EngineResult;
use crate::models::{
    Config, Currency, Race, RaceStatus, RecentWinner, ReferralAttribution, ReferralReward,
    ReferralSettings, SettlementError, SettlementTransfer, TransferStatus, Treasury,
    UserRaceResult, UserStats, Wager,
};

pub use cache::CacheStore;
pub use dual::DualStore;
pub use sqlite::SqliteStore;

/// Per-runner wager totals for odds display.
#[derive(Debug, Clone, PartialEq)]
pub struct WagerAggregate {
    pub race_id: String,
    pub currency: Currency,
    pub runner_idx: usize,
    pub total: Decimal,
    pub wager_count: u64,
}

/// Partial update applied alongside a transfer status change.
#[derive(Debug, Clone, Default)]
pub struct TransferUpdate {
    pub tx_sig: Option<String>,
    pub error: Option<String>,
    pub inc_attempts: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Races
    async fn create_race(&self, race: &Race) -> EngineResult<()>;
    async fn race(&self, id: &str) -> EngineResult<Option<Race>>;
    async fn races_by_status(&self, status: RaceStatus) -> EngineResult<Vec<Race>>;
    async fn all_races(&self) -> EngineResult<Vec<Race>>;
    async fn update_race(&self, race: &Race) -> EngineResult<()>;

    // Wagers
    /// Fails with `DuplicateSignature` on a sig collision.
    async fn create_wager(&self, wager: &Wager) -> EngineResult<()>;
    /// Insert-or-ignore; true when the row was actually inserted.
    async fn hydrate_wager(&self, wager: &Wager) -> EngineResult<bool>;
    /// Ascending timestamp, ties by insertion order.
    async fn wagers_by_race(&self, race_id: &str) -> EngineResult<Vec<Wager>>;
    async fn wagers_by_wallet(
        &self,
        wallet: &str,
        race_id: Option<&str>,
    ) -> EngineResult<Vec<Wager>>;
    async fn wager_aggregates_by_race(&self, race_id: &str) -> EngineResult<Vec<WagerAggregate>>;

    // Treasury
    /// Heals persisted negative balances to zero.
    async fn treasury(&self) -> EngineResult<Treasury>;
    async fn update_treasury(&self, treasury: &Treasury) -> EngineResult<()>;
    /// Atomic delta under the row lock; each balance clamps at zero.
    /// Returns the post-adjust `(race, sol)` balances.
    async fn adjust_jackpot_balances(
        &self,
        delta_race: Decimal,
        delta_sol: Decimal,
    ) -> EngineResult<(Decimal, Decimal)>;

    // SeenTx reservations
    async fn has_seen(&self, sig: &str) -> EngineResult<bool>;
    async fn record_seen(&self, sig: &str) -> EngineResult<()>;
    /// Atomic first-insert-wins; false when already reserved.
    async fn reserve(&self, sig: &str) -> EngineResult<bool>;
    async fn release(&self, sig: &str) -> EngineResult<()>;
    async fn cleanup_seen(&self, older_than_ms: i64) -> EngineResult<u64>;

    // Settlement transfers
    async fn record_transfer(&self, transfer: &SettlementTransfer) -> EngineResult<()>;
    async fn transfers_by_race(&self, race_id: &str) -> EngineResult<Vec<SettlementTransfer>>;
    async fn transfers_by_wallet(
        &self,
        wallet: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>>;
    async fn transfer_for_race_and_wallet(
        &self,
        race_id: &str,
        wallet: &str,
        currency: Currency,
    ) -> EngineResult<Option<SettlementTransfer>>;
    async fn update_transfer_status(
        &self,
        id: &str,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> EngineResult<()>;
    async fn failed_or_pending_transfers(
        &self,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>>;

    // Settlement errors
    async fn record_settlement_error(&self, error: &SettlementError) -> EngineResult<()>;
    async fn settlement_errors_by_race(
        &self,
        race_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementError>>;
    async fn recent_settlement_errors(&self, limit: usize) -> EngineResult<Vec<SettlementError>>;

    // Leaderboard projections
    async fn upsert_user_race_result(&self, result: &UserRaceResult) -> EngineResult<()>;
    async fn recalc_user_stats(&self, wallet: &str) -> EngineResult<UserStats>;
    async fn leaderboard(&self, limit: usize) -> EngineResult<Vec<UserStats>>;
    async fn user_rank(&self, wallet: &str) -> EngineResult<Option<u64>>;
    /// Rebuild stats that lag their results; true when anything was rebuilt.
    async fn rebuild_stale_projections(&self) -> EngineResult<bool>;

    // Recent winners
    /// Only SETTLED races with a winner are recorded; others are ignored.
    async fn add_recent_winner(&self, race: &Race) -> EngineResult<()>;
    async fn recent_winners(&self, limit: usize) -> EngineResult<Vec<RecentWinner>>;
    async fn cleanup_recent_winners(&self, keep: usize) -> EngineResult<u64>;

    // Referrals
    async fn referral_settings(&self) -> EngineResult<ReferralSettings>;
    async fn register_referral_code(&self, wallet: &str, code: &str) -> EngineResult<()>;
    async fn wallet_for_code(&self, code: &str) -> EngineResult<Option<String>>;
    async fn attribution_for(&self, wallet: &str) -> EngineResult<Option<ReferralAttribution>>;
    /// First-click wins; false when the wallet is already attributed.
    async fn attribute_wallet(
        &self,
        wallet: &str,
        code: &str,
        referrer: &str,
        now_ms: i64,
    ) -> EngineResult<bool>;
    /// Dedup by deterministic reward id; false when already queued.
    async fn enqueue_referral_reward(&self, reward: &ReferralReward) -> EngineResult<bool>;
    async fn queued_referral_rewards(&self, limit: usize) -> EngineResult<Vec<ReferralReward>>;
    async fn mark_rewards_paid(&self, ids: &[String]) -> EngineResult<()>;
}

/// Pick the backend at startup: durable-only (default), cache-only, or dual.
pub fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    if config.cache_only {
        info!("store backend: cache-only (volatile)");
        return Ok(Arc::new(CacheStore::new()));
    }

    let durable = Arc::new(SqliteStore::open(&config.database_path)?);
    if config.dual_store {
        info!(path = %config.database_path, "store backend: dual (cache over durable)");
        Ok(Arc::new(DualStore::new(durable)))
    } else {
        info!(path = %config.database_path, "store backend: durable");
        Ok(durable)
    }
}
