//! Parimutuel settlement.
//!
//! `compute_currency_settlement` is pure algebra over the race's wagers; the
//! `SettlementEngine` wraps it with the effectful steps (projections, jackpot
//! accounting, rake, payouts, referral queueing, loss events). Every on-chain
//! step is individually idempotent behind a reservation, so re-running a
//! partially settled race only performs the missing work.

pub mod payout;
pub mod referral;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::ledger::LedgerClient;
use crate::models::{
    floor_money, now_wall_ms, sentinel, Config, Currency, Race, RaceEvent, RacePhase,
    SettlementError, SettlementTransfer, TransferStatus, TransferType, UserRaceResult, Wager,
};
use crate::store::Store;

pub use payout::{PayoutExecutor, PayoutRecipient};

/// Rake parameters per currency: `(rake_bps, treasury_share_num, denom)`.
/// RACE splits treasury:jackpot 2:1, SOL splits 60:40.
fn rake_params(currency: Currency, race_rake_bps: u16) -> (u16, Decimal, Decimal) {
    match currency {
        Currency::Race => (race_rake_bps.min(500), Decimal::from(2), Decimal::from(3)),
        Currency::Sol => (500, Decimal::from(60), Decimal::from(100)),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutShare {
    pub wallet: String,
    pub amount: Decimal,
    pub refund: bool,
}

/// Per-wallet outcome used for leaderboard projections.
#[derive(Debug, Clone)]
pub struct ParticipantOutcome {
    pub wallet: String,
    pub wagered: Decimal,
    pub payout: Decimal,
    pub won: bool,
    pub refund: bool,
}

#[derive(Debug, Clone)]
pub struct CurrencySettlement {
    pub currency: Currency,
    pub total_pot: Decimal,
    pub rake: Decimal,
    pub treasury_rake: Decimal,
    pub jackpot_contribution: Decimal,
    pub jackpot_payout: Decimal,
    pub prize_pool: Decimal,
    /// Winner payouts or refunds, in wager insertion order.
    pub payouts: Vec<PayoutShare>,
    /// Non-winning wallets and the totals they lose; empty on refunds.
    pub losses: Vec<(String, Decimal)>,
    pub participants: Vec<ParticipantOutcome>,
    pub self_seeded: bool,
}

/// Pure settlement algebra for one currency.
///
/// `jackpot_balance` is the currency's jackpot balance at settlement time;
/// it pays out only when the race carries the jackpot flag.
pub fn compute_currency_settlement(
    race: &Race,
    winner_index: usize,
    wagers: &[Wager],
    currency: Currency,
    jackpot_balance: Decimal,
    escrow_wallet: &str,
) -> Option<CurrencySettlement> {
    let wagers: Vec<&Wager> = wagers.iter().filter(|w| w.currency == currency).collect();
    if wagers.is_empty() {
        return None;
    }

    let total_pot: Decimal = wagers.iter().map(|w| w.amount).sum();
    let self_seeded = wagers.iter().all(|w| w.wallet == escrow_wallet);

    let (rake_bps, share_num, share_den) = rake_params(currency, race.rake_bps);
    let mut rake = total_pot * Decimal::from(rake_bps) / Decimal::from(10_000u32);
    let mut jackpot_payout = if race.jackpot_flag {
        jackpot_balance
    } else {
        Decimal::ZERO
    };

    if self_seeded {
        rake = Decimal::ZERO;
        jackpot_payout = Decimal::ZERO;
    }

    let mut treasury_rake = floor_money(rake * share_num / share_den);
    let mut jackpot_contribution = rake - treasury_rake;

    // Per-wallet totals in insertion order.
    let mut order: Vec<String> = Vec::new();
    let mut wagered_by_wallet: HashMap<String, Decimal> = HashMap::new();
    let mut winning_by_wallet: HashMap<String, Decimal> = HashMap::new();
    for w in &wagers {
        if !wagered_by_wallet.contains_key(&w.wallet) {
            order.push(w.wallet.clone());
        }
        *wagered_by_wallet
            .entry(w.wallet.clone())
            .or_insert(Decimal::ZERO) += w.amount;
        if w.runner_idx == winner_index {
            *winning_by_wallet
                .entry(w.wallet.clone())
                .or_insert(Decimal::ZERO) += w.amount;
        }
    }

    let total_winning: Decimal = winning_by_wallet.values().copied().sum();

    let mut payouts = Vec::new();
    let mut losses = Vec::new();
    let mut participants = Vec::new();
    let prize_pool;

    if total_winning.is_zero() {
        // No winning wagers: full refunds, house takes nothing.
        rake = Decimal::ZERO;
        treasury_rake = Decimal::ZERO;
        jackpot_contribution = Decimal::ZERO;
        jackpot_payout = Decimal::ZERO;
        prize_pool = Decimal::ZERO;

        for wallet in &order {
            let refunded = wagered_by_wallet[wallet];
            payouts.push(PayoutShare {
                wallet: wallet.clone(),
                amount: refunded,
                refund: true,
            });
            participants.push(ParticipantOutcome {
                wallet: wallet.clone(),
                wagered: refunded,
                payout: refunded,
                won: false,
                refund: true,
            });
        }
    } else {
        prize_pool = total_pot - (treasury_rake + jackpot_contribution) + jackpot_payout;

        for wallet in &order {
            let wagered = wagered_by_wallet[wallet];
            match winning_by_wallet.get(wallet) {
                Some(winning) => {
                    let amount = floor_money(prize_pool * *winning / total_winning);
                    payouts.push(PayoutShare {
                        wallet: wallet.clone(),
                        amount,
                        refund: false,
                    });
                    participants.push(ParticipantOutcome {
                        wallet: wallet.clone(),
                        wagered,
                        payout: amount,
                        won: true,
                        refund: false,
                    });
                }
                None => {
                    losses.push((wallet.clone(), wagered));
                    participants.push(ParticipantOutcome {
                        wallet: wallet.clone(),
                        wagered,
                        payout: Decimal::ZERO,
                        won: false,
                        refund: false,
                    });
                }
            }
        }
    }

    Some(CurrencySettlement {
        currency,
        total_pot,
        rake,
        treasury_rake,
        jackpot_contribution,
        jackpot_payout,
        prize_pool,
        payouts,
        losses,
        participants,
        self_seeded,
    })
}

/// Effectful settlement execution for a SETTLED race.
pub struct SettlementEngine {
    store: Arc<dyn Store>,
    ledger: Arc<LedgerClient>,
    config: Arc<Config>,
    bus: EventBus,
    payout: PayoutExecutor,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<LedgerClient>,
        config: Arc<Config>,
        bus: EventBus,
    ) -> Self {
        let payout = PayoutExecutor::new(store.clone(), ledger.clone(), config.clone(), bus.clone());
        Self {
            store,
            ledger,
            config,
            bus,
            payout,
        }
    }

    pub fn payout_executor(&self) -> &PayoutExecutor {
        &self.payout
    }

    /// Run settlement for every currency of a settled race. Individual step
    /// failures are recorded and skipped; the race never gets stuck on one
    /// recipient.
    pub async fn execute(&self, race: &Race) -> EngineResult<Race> {
        let winner_index = race.winner_index().ok_or_else(|| {
            EngineError::InvalidTransition {
                from: race.status(),
                to: race.status(),
            }
        })?;

        if self.config.block_settlements {
            return Err(EngineError::MaintenanceBlocked(
                "settlement execution is blocked".into(),
            ));
        }

        let wagers = self.store.wagers_by_race(&race.id).await?;
        let treasury = self.store.treasury().await?;
        let mut race = race.clone();

        let mut currencies = vec![Currency::Sol];
        if self.config.enable_race_bets {
            currencies.push(Currency::Race);
        }

        for currency in currencies {
            // A resumed settlement reuses the jackpot amount persisted on the
            // race; the live balance was already drained by the first pass.
            let pinned = match &race.phase {
                RacePhase::Settled {
                    jackpot_added_sol,
                    jackpot_added_race,
                    ..
                } => match currency {
                    Currency::Sol => *jackpot_added_sol,
                    Currency::Race => *jackpot_added_race,
                },
                _ => Decimal::ZERO,
            };
            let jackpot_balance = if pinned > Decimal::ZERO {
                pinned
            } else {
                treasury.jackpot_balance(currency)
            };

            let settlement = match compute_currency_settlement(
                &race,
                winner_index,
                &wagers,
                currency,
                jackpot_balance,
                &self.config.escrow_wallet,
            ) {
                Some(s) => s,
                None => continue,
            };

            info!(
                race_id = %race.id,
                currency = %currency,
                total_pot = %settlement.total_pot,
                prize_pool = %settlement.prize_pool,
                winners = settlement.payouts.len(),
                "executing settlement"
            );

            self.record_projections(&race, &settlement).await;
            self.adjust_jackpot(&race, &settlement).await;
            self.mirror_jackpot_onchain(&race, &settlement, &treasury)
                .await;
            self.pay_rake(&race, &settlement, &treasury).await;
            self.execute_payouts(&race, &settlement, &treasury).await;
            referral::queue_rewards(
                self.store.as_ref(),
                &self.config,
                &race.id,
                &settlement,
            )
            .await;
            self.emit_losses(&race, &settlement);

            if settlement.jackpot_payout > Decimal::ZERO {
                if let RacePhase::Settled {
                    jackpot_added_sol,
                    jackpot_added_race,
                    ..
                } = &mut race.phase
                {
                    match currency {
                        Currency::Sol => *jackpot_added_sol = settlement.jackpot_payout,
                        Currency::Race => *jackpot_added_race = settlement.jackpot_payout,
                    }
                }
            }
        }

        self.store.update_race(&race).await?;
        Ok(race)
    }

    async fn record_error(
        &self,
        race_id: &str,
        currency: Currency,
        to_wallet: Option<String>,
        amount: Option<Decimal>,
        error: &str,
    ) {
        let row = SettlementError {
            id: uuid::Uuid::new_v4().to_string(),
            race_id: race_id.to_string(),
            to_wallet,
            amount,
            currency,
            error: error.to_string(),
            ts: now_wall_ms(),
        };
        if let Err(e) = self.store.record_settlement_error(&row).await {
            warn!(error = %e, "failed to record settlement error");
        }
    }

    /// Step 1: results + stats. House wallets participate with zero edge.
    async fn record_projections(&self, race: &Race, s: &CurrencySettlement) {
        for p in &s.participants {
            let house = self.config.is_house_wallet(&p.wallet);
            let edge_points = if house || p.refund {
                Decimal::ZERO
            } else {
                p.payout - p.wagered
            };
            let result = UserRaceResult {
                id: format!("urr_{}_{}_{}", race.id, p.wallet, s.currency),
                wallet: p.wallet.clone(),
                race_id: race.id.clone(),
                currency: s.currency,
                wagered: p.wagered,
                payout: p.payout,
                won: p.won,
                refund: p.refund,
                edge_points,
                ts: now_wall_ms(),
            };
            if let Err(e) = self.store.upsert_user_race_result(&result).await {
                warn!(error = %e, wallet = %p.wallet, "result projection failed");
                continue;
            }
            if let Err(e) = self.store.recalc_user_stats(&p.wallet).await {
                warn!(error = %e, wallet = %p.wallet, "stats recalc failed");
            }
        }
    }

    /// Step 2: jackpot balance delta, exactly once per (currency, race).
    async fn adjust_jackpot(&self, race: &Race, s: &CurrencySettlement) {
        let delta = s.jackpot_contribution - s.jackpot_payout;
        if delta.is_zero() {
            return;
        }
        let key = format!("jackpot_adjust_{}_{}", s.currency, race.id);
        match self.store.reserve(&key).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.record_error(&race.id, s.currency, None, None, &e.to_string())
                    .await;
                return;
            }
        }

        let (delta_race, delta_sol) = match s.currency {
            Currency::Race => (delta, Decimal::ZERO),
            Currency::Sol => (Decimal::ZERO, delta),
        };
        if let Err(e) = self
            .store
            .adjust_jackpot_balances(delta_race, delta_sol)
            .await
        {
            // Release so a retry can re-apply the adjustment.
            let _ = self.store.release(&key).await;
            self.record_error(&race.id, s.currency, None, None, &e.to_string())
                .await;
        }
    }

    /// Step 3: optional on-chain jackpot mirroring, each leg reserved.
    async fn mirror_jackpot_onchain(
        &self,
        race: &Race,
        s: &CurrencySettlement,
        treasury: &crate::models::Treasury,
    ) {
        if !self.config.jackpot_mirror_onchain {
            return;
        }

        // Jackpot wallet funds the payout before winners are paid.
        if s.jackpot_payout > Decimal::ZERO {
            self.jackpot_leg(
                race,
                s,
                treasury,
                &format!("jackpot_out_{}_{}", s.currency, race.id),
                &self.config.jackpot_wallet,
                &self.config.escrow_wallet,
                s.jackpot_payout,
                sentinel::ESCROW,
            )
            .await;
        }
        // Contribution flows back after payouts.
        if s.jackpot_contribution > Decimal::ZERO {
            self.jackpot_leg(
                race,
                s,
                treasury,
                &format!("jackpot_in_{}_{}", s.currency, race.id),
                &self.config.escrow_wallet,
                &self.config.jackpot_wallet,
                s.jackpot_contribution,
                sentinel::JACKPOT,
            )
            .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn jackpot_leg(
        &self,
        race: &Race,
        s: &CurrencySettlement,
        treasury: &crate::models::Treasury,
        key: &str,
        from: &str,
        to: &str,
        amount: Decimal,
        record_as: &str,
    ) {
        match self.store.reserve(key).await {
            Ok(true) => {}
            _ => return,
        }

        let sent = match s.currency {
            Currency::Sol => {
                let lamports = (amount * Decimal::from(crate::ledger::LAMPORTS_PER_SOL))
                    .trunc()
                    .to_u64()
                    .unwrap_or(0);
                self.ledger
                    .send_lamports(from, to, lamports, Some(key.to_string()))
                    .await
            }
            Currency::Race => match &treasury.race_mint {
                Some(mint) => {
                    self.ledger
                        .send_spl_checked(from, mint, to, amount, Some(key.to_string()))
                        .await
                }
                None => Err(EngineError::LedgerFatal("race mint not configured".into())),
            },
        };

        match sent {
            Ok(tx_sig) => {
                let row = SettlementTransfer {
                    id: key.to_string(),
                    race_id: race.id.clone(),
                    transfer_type: TransferType::Jackpot,
                    to_wallet: record_as.to_string(),
                    amount,
                    tx_sig: Some(tx_sig),
                    currency: s.currency,
                    ts: now_wall_ms(),
                    status: TransferStatus::Success,
                    attempts: 1,
                    last_error: None,
                    batch_id: None,
                    is_refund: false,
                };
                if let Err(e) = self.store.record_transfer(&row).await {
                    warn!(error = %e, "jackpot transfer row failed");
                }
            }
            Err(e) => {
                let _ = self.store.release(key).await;
                self.record_error(
                    &race.id,
                    s.currency,
                    Some(to.to_string()),
                    Some(amount),
                    &e.to_string(),
                )
                .await;
            }
        }
    }

    /// Step 4: rake to the treasury wallet, once.
    async fn pay_rake(
        &self,
        race: &Race,
        s: &CurrencySettlement,
        treasury: &crate::models::Treasury,
    ) {
        if s.treasury_rake <= Decimal::ZERO {
            return;
        }
        let key = format!("rake_{}_{}", s.currency, race.id);
        match self.store.reserve(&key).await {
            Ok(true) => {}
            _ => return,
        }

        let sent = match s.currency {
            Currency::Sol => {
                let lamports = (s.treasury_rake
                    * Decimal::from(crate::ledger::LAMPORTS_PER_SOL))
                .trunc()
                .to_u64()
                .unwrap_or(0);
                self.ledger
                    .send_lamports(
                        &self.config.escrow_wallet,
                        &self.config.treasury_wallet,
                        lamports,
                        Some(key.clone()),
                    )
                    .await
            }
            Currency::Race => match &treasury.race_mint {
                Some(mint) => {
                    self.ledger
                        .send_spl_checked(
                            &self.config.escrow_wallet,
                            mint,
                            &self.config.treasury_wallet,
                            s.treasury_rake,
                            Some(key.clone()),
                        )
                        .await
                }
                None => Err(EngineError::LedgerFatal("race mint not configured".into())),
            },
        };

        match sent {
            Ok(tx_sig) => {
                let row = SettlementTransfer {
                    id: key.clone(),
                    race_id: race.id.clone(),
                    transfer_type: TransferType::Rake,
                    to_wallet: sentinel::TREASURY.to_string(),
                    amount: s.treasury_rake,
                    tx_sig: Some(tx_sig),
                    currency: s.currency,
                    ts: now_wall_ms(),
                    status: TransferStatus::Success,
                    attempts: 1,
                    last_error: None,
                    batch_id: None,
                    is_refund: false,
                };
                if let Err(e) = self.store.record_transfer(&row).await {
                    warn!(error = %e, "rake transfer row failed");
                }
            }
            Err(e) => {
                let _ = self.store.release(&key).await;
                self.record_error(
                    &race.id,
                    s.currency,
                    Some(sentinel::TREASURY.to_string()),
                    Some(s.treasury_rake),
                    &e.to_string(),
                )
                .await;
            }
        }
    }

    /// Step 5: winner payouts / refunds through the batch executor. House
    /// recipients stay in escrow.
    async fn execute_payouts(
        &self,
        race: &Race,
        s: &CurrencySettlement,
        treasury: &crate::models::Treasury,
    ) {
        let recipients: Vec<PayoutRecipient> = s
            .payouts
            .iter()
            .filter(|p| p.amount > Decimal::ZERO)
            .filter(|p| !self.config.is_house_wallet(&p.wallet))
            .map(|p| PayoutRecipient {
                wallet: p.wallet.clone(),
                amount: p.amount,
                refund: p.refund,
            })
            .collect();
        if recipients.is_empty() {
            return;
        }

        let mint = match s.currency {
            Currency::Sol => None,
            Currency::Race => treasury.race_mint.clone(),
        };
        if s.currency == Currency::Race && mint.is_none() {
            self.record_error(
                &race.id,
                s.currency,
                None,
                None,
                "race mint not configured; payouts deferred",
            )
            .await;
            return;
        }

        if let Err(e) = self
            .payout
            .execute(&race.id, s.currency, mint.as_deref(), &recipients)
            .await
        {
            self.record_error(&race.id, s.currency, None, None, &e.to_string())
                .await;
        }
    }

    /// Step 7: loss events for non-winners of this currency.
    fn emit_losses(&self, race: &Race, s: &CurrencySettlement) {
        for (wallet, amount) in &s.losses {
            if self.config.is_house_wallet(wallet) {
                continue;
            }
            self.bus.publish(RaceEvent::UserLoss {
                race_id: race.id.clone(),
                wallet: wallet.clone(),
                currency: s.currency,
                amount: *amount,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PhaseStamp, RacePhase, Runner, SettlementEvidence};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn runner(i: usize) -> Runner {
        Runner {
            mint: format!("m{i}"),
            symbol: format!("T{i}"),
            name: None,
            pool_address: format!("p{i}"),
            initial_price: 1.0,
            initial_price_usd: 1.0,
            initial_price_ts: None,
            current_price: 1.0,
            price_change: 0.0,
            logo_uri: None,
        }
    }

    fn settled_race(id: &str, winner: usize, jackpot: bool) -> Race {
        Race {
            id: id.to_string(),
            start_ts: 0,
            rake_bps: 500,
            jackpot_flag: jackpot,
            runners: (0..3).map(runner).collect(),
            phase: RacePhase::Settled {
                locked: PhaseStamp::at(1),
                in_progress: PhaseStamp::at(2),
                settled: PhaseStamp::at(3),
                winner_index: winner,
                evidence: SettlementEvidence {
                    drand_round: None,
                    randomness: "[]".into(),
                    signature: format!("price_based_{winner}_1.0000"),
                },
                jackpot_added_sol: Decimal::ZERO,
                jackpot_added_race: Decimal::ZERO,
            },
            created_at: 0,
        }
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
            ts: 100,
            block_time_ms: None,
            slot: None,
            client_id: None,
            memo: None,
        }
    }

    #[test]
    fn two_winner_parimutuel_matches_hand_math() {
        // A->r0: 1.0, B->r0: 3.0, C->r1: 2.0; rake 5% split 60:40; r0 wins.
        let race = settled_race("r1", 0, false);
        let wagers = vec![
            wager("s1", "A", 0, "1.0"),
            wager("s2", "B", 0, "3.0"),
            wager("s3", "C", 1, "2.0"),
        ];

        let s = compute_currency_settlement(
            &race,
            0,
            &wagers,
            Currency::Sol,
            Decimal::ZERO,
            "escrow-wallet",
        )
        .unwrap();

        assert_eq!(s.total_pot, dec("6.0"));
        assert_eq!(s.rake, dec("0.30"));
        assert_eq!(s.treasury_rake, dec("0.18"));
        assert_eq!(s.jackpot_contribution, dec("0.12"));
        assert_eq!(s.prize_pool, dec("5.70"));

        assert_eq!(s.payouts.len(), 2);
        assert_eq!(s.payouts[0].wallet, "A");
        assert_eq!(s.payouts[0].amount, dec("1.425"));
        assert_eq!(s.payouts[1].wallet, "B");
        assert_eq!(s.payouts[1].amount, dec("4.275"));

        assert_eq!(s.losses, vec![("C".to_string(), dec("2.0"))]);
        assert!(!s.self_seeded);
    }

    #[test]
    fn settlement_algebra_balances_up_to_dust() {
        let race = settled_race("r1", 0, false);
        let wagers = vec![
            wager("s1", "A", 0, "1.0"),
            wager("s2", "B", 0, "0.3"),
            wager("s3", "C", 0, "0.7"),
            wager("s4", "D", 1, "2.0"),
        ];
        let s = compute_currency_settlement(
            &race,
            0,
            &wagers,
            Currency::Sol,
            Decimal::ZERO,
            "escrow-wallet",
        )
        .unwrap();

        let paid: Decimal = s.payouts.iter().map(|p| p.amount).sum();
        let accounted = paid + s.treasury_rake + s.jackpot_contribution - s.jackpot_payout;
        let dust = s.total_pot - accounted;
        assert!(dust >= Decimal::ZERO);
        assert!(dust < dec("0.000000003"), "dust was {dust}");
    }

    #[test]
    fn no_winners_refunds_everyone() {
        let race = settled_race("r1", 1, false);
        let wagers = vec![wager("s1", "A", 0, "1.0"), wager("s2", "B", 0, "2.0")];

        let s = compute_currency_settlement(
            &race,
            1,
            &wagers,
            Currency::Sol,
            Decimal::ZERO,
            "escrow-wallet",
        )
        .unwrap();

        assert_eq!(s.rake, Decimal::ZERO);
        assert_eq!(s.jackpot_contribution, Decimal::ZERO);
        assert_eq!(s.jackpot_payout, Decimal::ZERO);
        assert_eq!(s.prize_pool, Decimal::ZERO);
        assert!(s.losses.is_empty());

        let refunded: Decimal = s.payouts.iter().map(|p| p.amount).sum();
        assert_eq!(refunded, s.total_pot);
        assert!(s.payouts.iter().all(|p| p.refund));
        assert_eq!(s.payouts[0].amount, dec("1.0"));
        assert_eq!(s.payouts[1].amount, dec("2.0"));
    }

    #[test]
    fn jackpot_pays_into_prize_pool_when_flagged() {
        let race = settled_race("r1", 0, true);
        let wagers = vec![wager("s1", "A", 0, "1.0"), wager("s2", "B", 1, "1.0")];

        let s = compute_currency_settlement(
            &race,
            0,
            &wagers,
            Currency::Sol,
            dec("0.5"),
            "escrow-wallet",
        )
        .unwrap();

        assert_eq!(s.jackpot_payout, dec("0.5"));
        // 2.0 - rake(0.1 = 0.06+0.04) + 0.5
        assert_eq!(s.prize_pool, dec("2.40"));
        assert_eq!(s.payouts[0].amount, dec("2.40"));
    }

    #[test]
    fn self_seeded_race_takes_no_rake_or_jackpot() {
        let race = settled_race("r1", 0, true);
        let wagers = vec![
            wager("s1", "escrow-wallet", 0, "0.01"),
            wager("s2", "escrow-wallet", 1, "0.01"),
            wager("s3", "escrow-wallet", 2, "0.01"),
        ];

        let s = compute_currency_settlement(
            &race,
            0,
            &wagers,
            Currency::Sol,
            dec("100"),
            "escrow-wallet",
        )
        .unwrap();

        assert!(s.self_seeded);
        assert_eq!(s.rake, Decimal::ZERO);
        assert_eq!(s.treasury_rake, Decimal::ZERO);
        assert_eq!(s.jackpot_contribution, Decimal::ZERO);
        assert_eq!(s.jackpot_payout, Decimal::ZERO);
        assert_eq!(s.prize_pool, s.total_pot);
    }

    #[test]
    fn race_rake_is_capped_and_split_two_to_one() {
        let mut race = settled_race("r1", 0, false);
        race.rake_bps = 900; // over the cap
        let mut w1 = wager("s1", "A", 0, "300");
        w1.currency = Currency::Race;
        let mut w2 = wager("s2", "B", 1, "300");
        w2.currency = Currency::Race;

        let s = compute_currency_settlement(
            &race,
            0,
            &[w1, w2],
            Currency::Race,
            Decimal::ZERO,
            "escrow-wallet",
        )
        .unwrap();

        // capped at 500 bps: 600 * 0.05 = 30; treasury 2/3 = 20, jackpot 10.
        assert_eq!(s.rake, dec("30"));
        assert_eq!(s.treasury_rake, dec("20"));
        assert_eq!(s.jackpot_contribution, dec("10"));
    }

    #[test]
    fn payout_rounding_floors_to_nine_places() {
        let race = settled_race("r1", 0, false);
        let wagers = vec![
            wager("s1", "A", 0, "1.0"),
            wager("s2", "B", 0, "2.0"),
            // third wallet loses, making the pool awkward to divide
            wager("s3", "C", 1, "0.1"),
        ];
        let s = compute_currency_settlement(
            &race,
            0,
            &wagers,
            Currency::Sol,
            Decimal::ZERO,
            "escrow-wallet",
        )
        .unwrap();

        for p in &s.payouts {
            assert_eq!(p.amount, floor_money(p.amount), "not floored: {}", p.amount);
            assert!(p.amount.scale() <= 9);
        }
    }

    #[test]
    fn missing_currency_returns_none() {
        let race = settled_race("r1", 0, false);
        let wagers = vec![wager("s1", "A", 0, "1.0")];
        assert!(compute_currency_settlement(
            &race,
            0,
            &wagers,
            Currency::Race,
            Decimal::ZERO,
            "escrow-wallet",
        )
        .is_none());
    }
}
