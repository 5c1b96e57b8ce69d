//! Referral reward queueing as a settlement side effect.
//!
//! Rewards are computed on each wallet's share of the rake and enqueued with
//! deterministic ids, so re-running settlement can never double-queue.
//! Delivery of queued rewards happens outside the orchestrator.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::models::{floor_money, now_wall_ms, Config, ReferralReward, RewardStatus};
use crate::store::Store;

use super::CurrencySettlement;

/// Up to three ancestor levels plus the level-0 self-discount.
pub const MAX_LEVELS: usize = 3;

pub async fn queue_rewards(
    store: &dyn Store,
    config: &Config,
    race_id: &str,
    settlement: &CurrencySettlement,
) {
    if settlement.rake.is_zero() || settlement.total_pot.is_zero() {
        return;
    }

    let settings = match store.referral_settings().await {
        Ok(s) if s.enabled => s,
        Ok(_) => return,
        Err(e) => {
            warn!(error = %e, "referral settings unavailable");
            return;
        }
    };

    // Effective rake rate lets per-wallet shares reconstruct the rake they
    // contributed without re-deriving bps.
    let rake_rate = settlement.rake / settlement.total_pot;

    for p in &settlement.participants {
        if config.is_house_wallet(&p.wallet) {
            continue;
        }
        let wallet_rake = p.wagered * rake_rate;
        if wallet_rake.is_zero() {
            continue;
        }

        // Level 0: self-discount back to the bettor.
        enqueue(
            store,
            race_id,
            &p.wallet,
            &p.wallet,
            0,
            settlement,
            wallet_rake * Decimal::from(settings.self_bps) / Decimal::from(10_000u32),
        )
        .await;

        // Levels 1..=3: walk the attribution chain.
        let mut current = p.wallet.clone();
        for level in 1..=MAX_LEVELS {
            let referrer = match store.attribution_for(&current).await {
                Ok(Some(a)) => a.referrer_wallet,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, wallet = %current, "attribution lookup failed");
                    break;
                }
            };
            if referrer == p.wallet || config.is_house_wallet(&referrer) {
                break;
            }

            let bps = settings.level_bps[level - 1];
            enqueue(
                store,
                race_id,
                &p.wallet,
                &referrer,
                level as u8,
                settlement,
                wallet_rake * Decimal::from(bps) / Decimal::from(10_000u32),
            )
            .await;

            current = referrer;
        }
    }
}

async fn enqueue(
    store: &dyn Store,
    race_id: &str,
    from: &str,
    to: &str,
    level: u8,
    settlement: &CurrencySettlement,
    amount: Decimal,
) {
    let amount = floor_money(amount);
    if amount.is_zero() {
        return;
    }
    let reward = ReferralReward {
        id: format!("ref_{race_id}_{from}_{to}_{level}"),
        race_id: race_id.to_string(),
        from_wallet: from.to_string(),
        to_wallet: to.to_string(),
        level,
        currency: settlement.currency,
        amount,
        status: RewardStatus::Queued,
        created_at: now_wall_ms(),
    };
    match store.enqueue_referral_reward(&reward).await {
        Ok(true) => debug!(id = %reward.id, amount = %amount, "referral reward queued"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, id = %reward.id, "referral enqueue failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Currency, Wager};
    use crate::settlement::compute_currency_settlement;
    use crate::store::{SqliteStore, Store};
    use std::str::FromStr;
    use std::sync::Arc;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn wager(sig: &str, wallet: &str, idx: usize, amount: &str) -> Wager {
        Wager {
            id: format!("w_{sig}"),
            race_id: "r1".into(),
            wallet: wallet.into(),
            runner_idx: idx,
            amount: dec(amount),
            currency: Currency::Sol,
            sig: sig.into(),
            ts: 1,
            block_time_ms: None,
            slot: None,
            client_id: None,
            memo: None,
        }
    }

    fn settlement(wagers: &[Wager]) -> CurrencySettlement {
        let race = crate::models::Race {
            id: "r1".into(),
            start_ts: 0,
            rake_bps: 500,
            jackpot_flag: false,
            runners: vec![],
            phase: crate::models::RacePhase::Open,
            created_at: 0,
        };
        compute_currency_settlement(
            &race,
            0,
            wagers,
            Currency::Sol,
            Decimal::ZERO,
            "escrow-wallet",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rewards_walk_the_attribution_chain() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory());
        let config = Config::from_env().unwrap();

        // alice <- bob <- carol attribution chain.
        store.attribute_wallet("alice", "BOB1", "bob", 1).await.unwrap();
        store.attribute_wallet("bob", "CAROL1", "carol", 1).await.unwrap();

        let wagers = vec![wager("s1", "alice", 0, "10"), wager("s2", "dave", 1, "10")];
        let s = settlement(&wagers);

        queue_rewards(store.as_ref(), &config, "r1", &s).await;

        let queued = store.queued_referral_rewards(100).await.unwrap();
        // alice: self + bob(L1) + carol(L2); dave: self only.
        let to_wallets: Vec<(String, u8)> = queued
            .iter()
            .map(|r| (r.to_wallet.clone(), r.level))
            .collect();
        assert!(to_wallets.contains(&("alice".into(), 0)));
        assert!(to_wallets.contains(&("bob".into(), 1)));
        assert!(to_wallets.contains(&("carol".into(), 2)));
        assert!(to_wallets.contains(&("dave".into(), 0)));
        assert_eq!(queued.len(), 4);

        // alice wagered 10 of a 20 pot with 1.0 total rake -> 0.5 rake share.
        // Level 1 at 2000 bps = 0.1.
        let bob = queued
            .iter()
            .find(|r| r.to_wallet == "bob")
            .unwrap();
        assert_eq!(bob.amount, dec("0.1"));
        assert_eq!(bob.id, "ref_r1_alice_bob_1");
    }

    #[tokio::test]
    async fn re_running_settlement_does_not_double_queue() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory());
        let config = Config::from_env().unwrap();
        let wagers = vec![wager("s1", "alice", 0, "10"), wager("s2", "bob", 1, "10")];
        let s = settlement(&wagers);

        queue_rewards(store.as_ref(), &config, "r1", &s).await;
        let first = store.queued_referral_rewards(100).await.unwrap().len();
        queue_rewards(store.as_ref(), &config, "r1", &s).await;
        assert_eq!(store.queued_referral_rewards(100).await.unwrap().len(), first);
    }

    #[tokio::test]
    async fn zero_rake_queues_nothing() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory());
        let config = Config::from_env().unwrap();
        // All on the losing runner: refund path, rake zero.
        let wagers = vec![wager("s1", "alice", 1, "10")];
        let s = settlement(&wagers);
        assert!(s.rake.is_zero());

        queue_rewards(store.as_ref(), &config, "r1", &s).await;
        assert!(store.queued_referral_rewards(100).await.unwrap().is_empty());
    }
}
