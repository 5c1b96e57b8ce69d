//! Reconciliation loops: payout retries, bet backfill from chain history,
//! seen-signature GC, and the referral aggregation pass.
//!
//! Everything here is replay-safe: retries re-drive keyed batches, backfill
//! goes through insert-or-ignore hydration, and GC only drops reservations
//! old enough that their transactions can no longer be replayed against us.

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::EngineResult;
use crate::intake::parse_bet_memo;
use crate::ledger::{verify, LedgerClient, LAMPORTS_PER_SOL};
use crate::models::{now_wall_ms, Config, Currency, RaceStatus, Wager};
use crate::settlement::SettlementEngine;
use crate::store::Store;

const RETRY_BATCH_LIMIT: usize = 50;
const RESCAN_SIGNATURES: usize = 50;
const SEEN_GC_INTERVAL_MS: u64 = 3_600_000;
const REFERRAL_AGG_LIMIT: usize = 500;

pub struct Reconciler {
    store: Arc<dyn Store>,
    ledger: Arc<LedgerClient>,
    config: Arc<Config>,
    settlement: Arc<SettlementEngine>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<LedgerClient>,
        config: Arc<Config>,
        settlement: Arc<SettlementEngine>,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            settlement,
        }
    }

    pub fn spawn_loops(self: Arc<Self>) {
        let r = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                r.config.settlement_retry_interval_ms,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = r.retry_settlements().await {
                    warn!(error = %e, "settlement retry pass failed");
                }
            }
        });

        let r = self.clone();
        tokio::spawn(async move {
            // On boot and every interval after.
            loop {
                if let Err(e) = r.reconcile_bets().await {
                    warn!(error = %e, "bet reconciliation failed");
                }
                tokio::time::sleep(Duration::from_millis(r.config.reconcile_interval_ms)).await;
            }
        });

        let r = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(SEEN_GC_INTERVAL_MS));
            loop {
                interval.tick().await;
                let cutoff = now_wall_ms() - r.config.seen_tx_ttl_ms;
                match r.store.cleanup_seen(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "seen-tx entries dropped"),
                    Err(e) => warn!(error = %e, "seen-tx gc failed"),
                }
            }
        });

        let r = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(
                r.config.referral_payout_interval_ms,
            ));
            loop {
                interval.tick().await;
                if let Err(e) = r.aggregate_referrals().await {
                    warn!(error = %e, "referral aggregation failed");
                }
            }
        });
    }

    /// Re-drive failed or never-confirmed payout transfers. Batches are
    /// re-driven once per pass regardless of how many of their rows are
    /// pending.
    pub async fn retry_settlements(&self) -> EngineResult<()> {
        let transfers = self
            .store
            .failed_or_pending_transfers(RETRY_BATCH_LIMIT)
            .await?;
        if transfers.is_empty() {
            return Ok(());
        }
        info!(count = transfers.len(), "retrying settlement transfers");

        let treasury = self.store.treasury().await?;
        let executor = self.settlement.payout_executor();
        let mut redriven: HashSet<String> = HashSet::new();

        for t in transfers {
            let mint = match t.currency {
                Currency::Sol => None,
                Currency::Race => treasury.race_mint.clone(),
            };
            if t.currency == Currency::Race && mint.is_none() {
                continue;
            }
            if let Some(batch_id) = &t.batch_id {
                if !redriven.insert(batch_id.clone()) {
                    continue;
                }
            }
            executor.retry_transfer(&t, mint.as_deref()).await;
        }
        Ok(())
    }

    /// Backfill wagers whose client confirmation raced ahead of the intake
    /// call: rescan recent escrow signatures and hydrate anything carrying a
    /// bet memo.
    pub async fn reconcile_bets(&self) -> EngineResult<()> {
        let sigs = self
            .ledger
            .rpc()
            .signatures_for_address(&self.config.escrow_wallet, RESCAN_SIGNATURES)
            .await?;

        for sig in sigs {
            if self.store.has_seen(&sig).await? {
                continue;
            }
            if let Err(e) = self.recover_bet(&sig).await {
                warn!(sig = %sig, error = %e, "bet recovery failed");
            }
        }
        Ok(())
    }

    async fn recover_bet(&self, sig: &str) -> EngineResult<()> {
        let raw = match self.ledger.rpc().parsed_transaction(sig).await? {
            Some(raw) => raw,
            None => return Ok(()),
        };

        let memo = match verify::extract_memo(&raw) {
            Some(memo) => memo,
            None => return Ok(()),
        };
        let Some((race_id, runner_idx)) = parse_bet_memo(&memo) else {
            return Ok(());
        };

        // A recovered wager still has to target a race that accepts them.
        let race = match self.store.race(&race_id).await? {
            Some(race) if race.status() == RaceStatus::Open => race,
            _ => {
                self.store.record_seen(sig).await?;
                return Ok(());
            }
        };
        if runner_idx >= race.runners.len() {
            self.store.record_seen(sig).await?;
            return Ok(());
        }

        let treasury = self.store.treasury().await?;
        let escrow = self.config.escrow_wallet.as_str();

        // SPL transfer into escrow of the RACE mint, else a native deposit.
        let transfers = verify::match_spl_transfers(&raw);
        let (wallet, amount, currency) = if let Some(t) = transfers.iter().find(|t| {
            t.recipient == escrow && Some(t.mint.as_str()) == treasury.race_mint.as_deref()
        }) {
            (t.sender.clone(), t.amount, Currency::Race)
        } else {
            let delta = verify::lamport_delta(&raw, escrow);
            if delta <= 0 {
                self.store.record_seen(sig).await?;
                return Ok(());
            }
            let sender = raw
                .account_keys
                .iter()
                .find(|k| k.as_str() != escrow && verify::lamport_delta(&raw, k) < 0)
                .cloned();
            let Some(sender) = sender else {
                self.store.record_seen(sig).await?;
                return Ok(());
            };
            (
                sender,
                Decimal::from(delta as u64) / Decimal::from(LAMPORTS_PER_SOL),
                Currency::Sol,
            )
        };

        let wager = Wager {
            id: format!("wager_{}", uuid::Uuid::new_v4()),
            race_id,
            wallet,
            runner_idx,
            amount,
            currency,
            sig: sig.to_string(),
            ts: raw.block_time_ms.unwrap_or_else(now_wall_ms),
            block_time_ms: raw.block_time_ms,
            slot: Some(raw.slot),
            client_id: None,
            memo: Some(memo),
        };

        self.store.record_seen(sig).await?;
        if self.store.hydrate_wager(&wager).await? {
            info!(sig = %sig, race_id = %wager.race_id, wallet = %wager.wallet, "wager recovered from chain");
        }
        Ok(())
    }

    /// Periodic view of referral obligations ready for delivery. Amounts
    /// under the threshold keep accumulating in the queue.
    pub async fn aggregate_referrals(&self) -> EngineResult<()> {
        let settings = self.store.referral_settings().await?;
        let queued = self
            .store
            .queued_referral_rewards(REFERRAL_AGG_LIMIT)
            .await?;
        if queued.is_empty() {
            return Ok(());
        }

        let mut totals: std::collections::HashMap<(String, Currency), Decimal> =
            Default::default();
        for r in &queued {
            *totals
                .entry((r.to_wallet.clone(), r.currency))
                .or_insert(Decimal::ZERO) += r.amount;
        }

        for ((wallet, currency), total) in totals {
            if total >= settings.min_payout {
                // Delivery runs outside the orchestrator; the queue is the
                // contract.
                debug!(wallet = %wallet, currency = %currency, total = %total, "referral rewards ready for delivery");
            }
        }
        Ok(())
    }
}
