//! Hot in-memory store.
//!
//! Same contract as the durable backend, held in maps under one RwLock.
//! Used standalone in cache-only mode and as the read side of the dual store;
//! everything here can be rebuilt from the durable store.

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::{EngineError, EngineResult};
use crate::models::{
    now_wall_ms, Currency, Race, RaceStatus, RecentWinner, ReferralAttribution, ReferralReward,
    ReferralSettings, RewardStatus, SettlementError, SettlementTransfer, TransferStatus, Treasury,
    UserRaceResult, UserStats, Wager,
};

use super::{Store, TransferUpdate, WagerAggregate};

#[derive(Default)]
struct CacheState {
    races: HashMap<String, Race>,
    /// Insertion-ordered wagers; sig uniqueness enforced via `wager_sigs`.
    wagers: Vec<Wager>,
    wager_sigs: HashSet<String>,
    treasury: Treasury,
    seen_tx: HashMap<String, i64>,
    transfers: Vec<SettlementTransfer>,
    settlement_errors: Vec<SettlementError>,
    results: HashMap<(String, String, Currency), UserRaceResult>,
    stats: HashMap<String, UserStats>,
    recent_winners: Vec<RecentWinner>,
    referral_codes: HashMap<String, String>,
    attributions: HashMap<String, ReferralAttribution>,
    rewards: BTreeMap<String, ReferralReward>,
    referral_settings: ReferralSettings,
}

pub struct CacheStore {
    state: RwLock<CacheState>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
        }
    }

    fn stats_from_results(wallet: &str, results: &[&UserRaceResult]) -> UserStats {
        let mut stats = UserStats {
            wallet: wallet.to_string(),
            races: 0,
            wins: 0,
            total_wagered: Decimal::ZERO,
            total_payout: Decimal::ZERO,
            net: Decimal::ZERO,
            edge_points: Decimal::ZERO,
            updated_at: now_wall_ms(),
        };
        for r in results {
            stats.races += 1;
            if r.won {
                stats.wins += 1;
            }
            stats.total_wagered += r.wagered;
            stats.total_payout += r.payout;
            stats.edge_points += r.edge_points;
        }
        stats.net = stats.total_payout - stats.total_wagered;
        stats
    }

    fn recalc_locked(state: &mut CacheState, wallet: &str) -> UserStats {
        let results: Vec<&UserRaceResult> = state
            .results
            .values()
            .filter(|r| r.wallet == wallet)
            .collect();
        let stats = Self::stats_from_results(wallet, &results);
        state.stats.insert(wallet.to_string(), stats.clone());
        stats
    }
}

#[async_trait]
impl Store for CacheStore {
    async fn create_race(&self, race: &Race) -> EngineResult<()> {
        let mut s = self.state.write();
        if s.races.contains_key(&race.id) {
            return Err(EngineError::store(format!("race {} exists", race.id)));
        }
        s.races.insert(race.id.clone(), race.clone());
        Ok(())
    }

    async fn race(&self, id: &str) -> EngineResult<Option<Race>> {
        Ok(self.state.read().races.get(id).cloned())
    }

    async fn races_by_status(&self, status: RaceStatus) -> EngineResult<Vec<Race>> {
        let s = self.state.read();
        let mut races: Vec<Race> = s
            .races
            .values()
            .filter(|r| r.status() == status)
            .cloned()
            .collect();
        races.sort_by_key(|r| r.start_ts);
        Ok(races)
    }

    async fn all_races(&self) -> EngineResult<Vec<Race>> {
        let s = self.state.read();
        let mut races: Vec<Race> = s.races.values().cloned().collect();
        races.sort_by_key(|r| r.start_ts);
        Ok(races)
    }

    async fn update_race(&self, race: &Race) -> EngineResult<()> {
        let mut s = self.state.write();
        if !s.races.contains_key(&race.id) {
            return Err(EngineError::RaceNotFound(race.id.clone()));
        }
        s.races.insert(race.id.clone(), race.clone());
        Ok(())
    }

    async fn create_wager(&self, wager: &Wager) -> EngineResult<()> {
        let mut s = self.state.write();
        if !s.wager_sigs.insert(wager.sig.clone()) {
            return Err(EngineError::DuplicateSignature(wager.sig.clone()));
        }
        s.wagers.push(wager.clone());
        Ok(())
    }

    async fn hydrate_wager(&self, wager: &Wager) -> EngineResult<bool> {
        let mut s = self.state.write();
        if !s.wager_sigs.insert(wager.sig.clone()) {
            return Ok(false);
        }
        s.wagers.push(wager.clone());
        Ok(true)
    }

    async fn wagers_by_race(&self, race_id: &str) -> EngineResult<Vec<Wager>> {
        let s = self.state.read();
        let mut wagers: Vec<Wager> = s
            .wagers
            .iter()
            .filter(|w| w.race_id == race_id)
            .cloned()
            .collect();
        wagers.sort_by_key(|w| w.ts);
        Ok(wagers)
    }

    async fn wagers_by_wallet(
        &self,
        wallet: &str,
        race_id: Option<&str>,
    ) -> EngineResult<Vec<Wager>> {
        let s = self.state.read();
        let mut wagers: Vec<Wager> = s
            .wagers
            .iter()
            .filter(|w| w.wallet == wallet && race_id.map(|r| w.race_id == r).unwrap_or(true))
            .cloned()
            .collect();
        wagers.sort_by_key(|w| w.ts);
        Ok(wagers)
    }

    async fn wager_aggregates_by_race(&self, race_id: &str) -> EngineResult<Vec<WagerAggregate>> {
        let wagers = self.wagers_by_race(race_id).await?;
        let mut agg: BTreeMap<(Currency, usize), (Decimal, u64)> = BTreeMap::new();
        for w in &wagers {
            let e = agg
                .entry((w.currency, w.runner_idx))
                .or_insert((Decimal::ZERO, 0));
            e.0 += w.amount;
            e.1 += 1;
        }
        Ok(agg
            .into_iter()
            .map(|((currency, runner_idx), (total, count))| WagerAggregate {
                race_id: race_id.to_string(),
                currency,
                runner_idx,
                total,
                wager_count: count,
            })
            .collect())
    }

    async fn treasury(&self) -> EngineResult<Treasury> {
        let mut s = self.state.write();
        if s.treasury.jackpot_balance_race < Decimal::ZERO {
            s.treasury.jackpot_balance_race = Decimal::ZERO;
        }
        if s.treasury.jackpot_balance_sol < Decimal::ZERO {
            s.treasury.jackpot_balance_sol = Decimal::ZERO;
        }
        Ok(s.treasury.clone())
    }

    async fn update_treasury(&self, treasury: &Treasury) -> EngineResult<()> {
        let mut s = self.state.write();
        s.treasury = treasury.clone();
        s.treasury.jackpot_balance_race = s.treasury.jackpot_balance_race.max(Decimal::ZERO);
        s.treasury.jackpot_balance_sol = s.treasury.jackpot_balance_sol.max(Decimal::ZERO);
        Ok(())
    }

    async fn adjust_jackpot_balances(
        &self,
        delta_race: Decimal,
        delta_sol: Decimal,
    ) -> EngineResult<(Decimal, Decimal)> {
        let mut s = self.state.write();
        s.treasury.jackpot_balance_race =
            (s.treasury.jackpot_balance_race + delta_race).max(Decimal::ZERO);
        s.treasury.jackpot_balance_sol =
            (s.treasury.jackpot_balance_sol + delta_sol).max(Decimal::ZERO);
        Ok((
            s.treasury.jackpot_balance_race,
            s.treasury.jackpot_balance_sol,
        ))
    }

    async fn has_seen(&self, sig: &str) -> EngineResult<bool> {
        Ok(self.state.read().seen_tx.contains_key(sig))
    }

    async fn record_seen(&self, sig: &str) -> EngineResult<()> {
        self.state
            .write()
            .seen_tx
            .entry(sig.to_string())
            .or_insert_with(now_wall_ms);
        Ok(())
    }

    async fn reserve(&self, sig: &str) -> EngineResult<bool> {
        let mut s = self.state.write();
        if s.seen_tx.contains_key(sig) {
            return Ok(false);
        }
        s.seen_tx.insert(sig.to_string(), now_wall_ms());
        Ok(true)
    }

    async fn release(&self, sig: &str) -> EngineResult<()> {
        self.state.write().seen_tx.remove(sig);
        Ok(())
    }

    async fn cleanup_seen(&self, older_than_ms: i64) -> EngineResult<u64> {
        let mut s = self.state.write();
        let before = s.seen_tx.len();
        s.seen_tx.retain(|_, seen_at| *seen_at >= older_than_ms);
        Ok((before - s.seen_tx.len()) as u64)
    }

    async fn record_transfer(&self, transfer: &SettlementTransfer) -> EngineResult<()> {
        let mut s = self.state.write();
        match s.transfers.iter_mut().find(|t| t.id == transfer.id) {
            Some(existing) => *existing = transfer.clone(),
            None => s.transfers.push(transfer.clone()),
        }
        Ok(())
    }

    async fn transfers_by_race(&self, race_id: &str) -> EngineResult<Vec<SettlementTransfer>> {
        Ok(self
            .state
            .read()
            .transfers
            .iter()
            .filter(|t| t.race_id == race_id)
            .cloned()
            .collect())
    }

    async fn transfers_by_wallet(
        &self,
        wallet: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>> {
        let s = self.state.read();
        let mut transfers: Vec<SettlementTransfer> = s
            .transfers
            .iter()
            .filter(|t| t.to_wallet == wallet)
            .cloned()
            .collect();
        transfers.sort_by_key(|t| std::cmp::Reverse(t.ts));
        transfers.truncate(limit);
        Ok(transfers)
    }

    async fn transfer_for_race_and_wallet(
        &self,
        race_id: &str,
        wallet: &str,
        currency: Currency,
    ) -> EngineResult<Option<SettlementTransfer>> {
        Ok(self
            .state
            .read()
            .transfers
            .iter()
            .find(|t| {
                t.race_id == race_id
                    && t.to_wallet == wallet
                    && t.currency == currency
                    && t.transfer_type == crate::models::TransferType::Payout
            })
            .cloned())
    }

    async fn update_transfer_status(
        &self,
        id: &str,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> EngineResult<()> {
        let mut s = self.state.write();
        if let Some(t) = s.transfers.iter_mut().find(|t| t.id == id) {
            t.status = status;
            if let Some(sig) = update.tx_sig {
                t.tx_sig = Some(sig);
            }
            if let Some(err) = update.error {
                t.last_error = Some(err);
            }
            if update.inc_attempts {
                t.attempts += 1;
            }
        }
        Ok(())
    }

    async fn failed_or_pending_transfers(
        &self,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>> {
        let s = self.state.read();
        let mut transfers: Vec<SettlementTransfer> = s
            .transfers
            .iter()
            .filter(|t| {
                matches!(t.status, TransferStatus::Pending | TransferStatus::Failed)
            })
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.ts);
        transfers.truncate(limit);
        Ok(transfers)
    }

    async fn record_settlement_error(&self, error: &SettlementError) -> EngineResult<()> {
        self.state.write().settlement_errors.push(error.clone());
        Ok(())
    }

    async fn settlement_errors_by_race(
        &self,
        race_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementError>> {
        let s = self.state.read();
        let mut errors: Vec<SettlementError> = s
            .settlement_errors
            .iter()
            .filter(|e| e.race_id == race_id)
            .cloned()
            .collect();
        errors.sort_by_key(|e| std::cmp::Reverse(e.ts));
        errors.truncate(limit);
        Ok(errors)
    }

    async fn recent_settlement_errors(&self, limit: usize) -> EngineResult<Vec<SettlementError>> {
        let s = self.state.read();
        let mut errors: Vec<SettlementError> = s.settlement_errors.clone();
        errors.sort_by_key(|e| std::cmp::Reverse(e.ts));
        errors.truncate(limit);
        Ok(errors)
    }

    async fn upsert_user_race_result(&self, result: &UserRaceResult) -> EngineResult<()> {
        let mut s = self.state.write();
        s.results.insert(
            (
                result.wallet.clone(),
                result.race_id.clone(),
                result.currency,
            ),
            result.clone(),
        );
        Ok(())
    }

    async fn recalc_user_stats(&self, wallet: &str) -> EngineResult<UserStats> {
        let mut s = self.state.write();
        Ok(Self::recalc_locked(&mut s, wallet))
    }

    async fn leaderboard(&self, limit: usize) -> EngineResult<Vec<UserStats>> {
        let s = self.state.read();
        let mut stats: Vec<UserStats> = s.stats.values().cloned().collect();
        stats.sort_by(|a, b| {
            b.edge_points
                .cmp(&a.edge_points)
                .then_with(|| a.wallet.cmp(&b.wallet))
        });
        stats.truncate(limit);
        Ok(stats)
    }

    async fn user_rank(&self, wallet: &str) -> EngineResult<Option<u64>> {
        let s = self.state.read();
        let points = match s.stats.get(wallet) {
            Some(stats) => stats.edge_points,
            None => return Ok(None),
        };
        let ahead = s.stats.values().filter(|s| s.edge_points > points).count();
        Ok(Some(ahead as u64 + 1))
    }

    async fn rebuild_stale_projections(&self) -> EngineResult<bool> {
        let mut s = self.state.write();
        let wallets: Vec<String> = {
            let mut counts: HashMap<&str, u64> = HashMap::new();
            for r in s.results.values() {
                *counts.entry(r.wallet.as_str()).or_default() += 1;
            }
            counts
                .into_iter()
                .filter(|(wallet, n)| {
                    s.stats.get(*wallet).map(|st| st.races < *n).unwrap_or(true)
                })
                .map(|(wallet, _)| wallet.to_string())
                .collect()
        };
        if wallets.is_empty() {
            return Ok(false);
        }
        for wallet in &wallets {
            Self::recalc_locked(&mut s, wallet);
        }
        Ok(true)
    }

    async fn add_recent_winner(&self, race: &Race) -> EngineResult<()> {
        let (winner_index, settled_ts) =
            match (race.winner_index(), race.phase.settled_stamp()) {
                (Some(w), Some(s)) => (w, s.ts),
                _ => return Ok(()),
            };
        let runner = match race.runners.get(winner_index) {
            Some(r) => r,
            None => return Ok(()),
        };

        let mut s = self.state.write();
        s.recent_winners.retain(|w| w.race_id != race.id);
        s.recent_winners.push(RecentWinner {
            race_id: race.id.clone(),
            winner_index,
            mint: runner.mint.clone(),
            symbol: runner.symbol.clone(),
            price_change: runner.price_change,
            settled_ts,
        });
        Ok(())
    }

    async fn recent_winners(&self, limit: usize) -> EngineResult<Vec<RecentWinner>> {
        let s = self.state.read();
        let mut winners = s.recent_winners.clone();
        winners.sort_by_key(|w| std::cmp::Reverse(w.settled_ts));
        winners.truncate(limit);
        Ok(winners)
    }

    async fn cleanup_recent_winners(&self, keep: usize) -> EngineResult<u64> {
        let mut s = self.state.write();
        s.recent_winners
            .sort_by_key(|w| std::cmp::Reverse(w.settled_ts));
        let before = s.recent_winners.len();
        s.recent_winners.truncate(keep);
        Ok((before - s.recent_winners.len()) as u64)
    }

    async fn referral_settings(&self) -> EngineResult<ReferralSettings> {
        Ok(self.state.read().referral_settings.clone())
    }

    async fn register_referral_code(&self, wallet: &str, code: &str) -> EngineResult<()> {
        self.state
            .write()
            .referral_codes
            .entry(code.to_string())
            .or_insert_with(|| wallet.to_string());
        Ok(())
    }

    async fn wallet_for_code(&self, code: &str) -> EngineResult<Option<String>> {
        Ok(self.state.read().referral_codes.get(code).cloned())
    }

    async fn attribution_for(&self, wallet: &str) -> EngineResult<Option<ReferralAttribution>> {
        Ok(self.state.read().attributions.get(wallet).cloned())
    }

    async fn attribute_wallet(
        &self,
        wallet: &str,
        code: &str,
        referrer: &str,
        now_ms: i64,
    ) -> EngineResult<bool> {
        let mut s = self.state.write();
        if s.attributions.contains_key(wallet) {
            return Ok(false);
        }
        s.attributions.insert(
            wallet.to_string(),
            ReferralAttribution {
                wallet: wallet.to_string(),
                code: code.to_string(),
                referrer_wallet: referrer.to_string(),
                attributed_at: now_ms,
            },
        );
        Ok(true)
    }

    async fn enqueue_referral_reward(&self, reward: &ReferralReward) -> EngineResult<bool> {
        let mut s = self.state.write();
        if s.rewards.contains_key(&reward.id) {
            return Ok(false);
        }
        s.rewards.insert(reward.id.clone(), reward.clone());
        Ok(true)
    }

    async fn queued_referral_rewards(&self, limit: usize) -> EngineResult<Vec<ReferralReward>> {
        let s = self.state.read();
        let mut rewards: Vec<ReferralReward> = s
            .rewards
            .values()
            .filter(|r| r.status == RewardStatus::Queued)
            .cloned()
            .collect();
        rewards.sort_by_key(|r| r.created_at);
        rewards.truncate(limit);
        Ok(rewards)
    }

    async fn mark_rewards_paid(&self, ids: &[String]) -> EngineResult<()> {
        let mut s = self.state.write();
        for id in ids {
            if let Some(r) = s.rewards.get_mut(id) {
                r.status = RewardStatus::Paid;
            }
        }
        Ok(())
    }
}
