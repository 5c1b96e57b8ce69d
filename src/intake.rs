//! Wager intake: validate, reserve, verify on-chain, persist, announce.
//!
//! The reservation happens before ledger verification so two submissions of
//! the same signature can never both pass the expensive check; the loser of
//! the race gets `DuplicateSignature` immediately.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::ledger::{LedgerClient, VerifyOutcome, LAMPORTS_PER_SOL};
use crate::models::{Config, Currency, RaceEvent, RaceStatus, Wager};
use crate::state_machine::StateMachine;
use crate::store::Store;

const VERIFY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct WagerRequest {
    pub race_id: String,
    pub wallet: String,
    pub runner_idx: usize,
    pub amount: Decimal,
    pub sig: String,
    pub currency: Currency,
    pub client_id: Option<String>,
    pub memo: Option<String>,
}

/// Referral code carried in a wager memo: a `ref:<code>` segment, e.g.
/// `bet:race_abc:2:ref:FRIEND1`.
pub fn parse_referral_code(memo: &str) -> Option<String> {
    let mut parts = memo.split(':');
    while let Some(part) = parts.next() {
        if part == "ref" {
            return parts
                .next()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty());
        }
    }
    None
}

/// `bet:<raceId>:<runnerIdx>[:ref:<code>]` — the memo convention wallets
/// attach so replayed transactions can be reconstructed into wagers.
pub fn parse_bet_memo(memo: &str) -> Option<(String, usize)> {
    let mut parts = memo.split(':');
    if parts.next() != Some("bet") {
        return None;
    }
    let race_id = parts.next()?.to_string();
    let runner_idx = parts.next()?.parse::<usize>().ok()?;
    Some((race_id, runner_idx))
}

pub struct WagerIntake {
    store: Arc<dyn Store>,
    ledger: Arc<LedgerClient>,
    sm: Arc<StateMachine>,
    config: Arc<Config>,
    bus: EventBus,
}

impl WagerIntake {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<LedgerClient>,
        sm: Arc<StateMachine>,
        config: Arc<Config>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            ledger,
            sm,
            config,
            bus,
        }
    }

    pub async fn place(&self, req: WagerRequest) -> EngineResult<Wager> {
        if self.config.block_new_bets {
            return Err(EngineError::MaintenanceBlocked("new bets are blocked".into()));
        }
        if req.currency == Currency::Race && !self.config.enable_race_bets {
            return Err(EngineError::MaintenanceBlocked(
                "RACE wagers are disabled".into(),
            ));
        }

        // Effective status, not stored status: a race past its window is no
        // longer accepting wagers even before the timer fires.
        let race = self
            .store
            .race(&req.race_id)
            .await?
            .ok_or_else(|| EngineError::RaceNotFound(req.race_id.clone()))?;
        if self.sm.expected_status_for(&race).await? != RaceStatus::Open
            || race.status() != RaceStatus::Open
        {
            return Err(EngineError::InvalidTransition {
                from: race.status(),
                to: race.status(),
            });
        }
        if req.runner_idx >= race.runners.len() {
            return Err(EngineError::Store(format!(
                "runner index {} out of range",
                req.runner_idx
            )));
        }

        let (min, max) = self.config.wager_envelope(req.currency);
        if req.amount < min || req.amount > max {
            return Err(EngineError::BudgetExceeded(format!(
                "amount {} outside [{min}, {max}] {}",
                req.amount, req.currency
            )));
        }

        if !self.store.reserve(&req.sig).await? {
            return Err(EngineError::DuplicateSignature(req.sig.clone()));
        }

        let outcome = match self.verify_with_retry(&req).await {
            Ok(outcome) if outcome.valid => outcome,
            Ok(_) => {
                self.store.release(&req.sig).await?;
                return Err(EngineError::LedgerFatal(
                    "transaction does not match the wager".into(),
                ));
            }
            Err(e) => {
                self.store.release(&req.sig).await?;
                return Err(e);
            }
        };

        // First-click referral attribution from the on-chain memo.
        let memo = outcome.memo.clone().or_else(|| req.memo.clone());
        if let Some(code) = memo.as_deref().and_then(parse_referral_code) {
            self.attribute(&req.wallet, &code).await;
        }

        let wager = Wager {
            id: format!("wager_{}", uuid::Uuid::new_v4()),
            race_id: req.race_id.clone(),
            wallet: req.wallet.clone(),
            runner_idx: req.runner_idx,
            amount: req.amount,
            currency: req.currency,
            sig: req.sig.clone(),
            ts: crate::models::now_wall_ms(),
            block_time_ms: outcome.block_time_ms,
            slot: outcome.slot,
            client_id: req.client_id,
            memo,
        };
        self.store.create_wager(&wager).await?;

        info!(
            race_id = %wager.race_id,
            wallet = %wager.wallet,
            runner = wager.runner_idx,
            amount = %wager.amount,
            currency = %wager.currency,
            "wager accepted"
        );
        self.bus.publish(RaceEvent::BetPlaced {
            wager: wager.clone(),
        });
        Ok(wager)
    }

    async fn verify_with_retry(&self, req: &WagerRequest) -> EngineResult<VerifyOutcome> {
        let mut last_err = EngineError::LedgerTransient("verification never ran".into());
        for attempt in 1..=VERIFY_ATTEMPTS {
            let result = match req.currency {
                Currency::Sol => {
                    let lamports = (req.amount * Decimal::from(LAMPORTS_PER_SOL))
                        .trunc()
                        .to_u64()
                        .unwrap_or(0);
                    self.ledger
                        .verify_sol_transfer(
                            &req.sig,
                            &self.config.escrow_wallet,
                            lamports,
                            Some(&req.wallet),
                        )
                        .await
                }
                Currency::Race => {
                    let treasury = self.store.treasury().await?;
                    let mint = treasury.race_mint.ok_or_else(|| {
                        EngineError::LedgerFatal("race mint not configured".into())
                    })?;
                    self.ledger
                        .verify_spl_transfer(
                            &req.sig,
                            &mint,
                            &self.config.escrow_wallet,
                            req.amount,
                            Some(&req.wallet),
                        )
                        .await
                }
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < VERIFY_ATTEMPTS => {
                    debug!(sig = %req.sig, attempt, error = %e, "verification retry");
                    tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn attribute(&self, wallet: &str, code: &str) {
        let referrer = match self.store.wallet_for_code(code).await {
            Ok(Some(referrer)) => referrer,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, code, "referral code lookup failed");
                return;
            }
        };
        if referrer == wallet || self.config.is_house_wallet(&referrer) {
            return;
        }
        match self
            .store
            .attribute_wallet(wallet, code, &referrer, crate::models::now_wall_ms())
            .await
        {
            Ok(true) => info!(wallet, code, referrer = %referrer, "wallet attributed"),
            Ok(false) => {} // first click already won
            Err(e) => warn!(error = %e, wallet, "attribution failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_code_parses_from_memo() {
        assert_eq!(
            parse_referral_code("bet:race_1:2:ref:FRIEND1").as_deref(),
            Some("FRIEND1")
        );
        assert_eq!(parse_referral_code("ref:ABC").as_deref(), Some("ABC"));
        assert_eq!(parse_referral_code("bet:race_1:2"), None);
        assert_eq!(parse_referral_code("ref:"), None);
        assert_eq!(parse_referral_code(""), None);
    }

    #[test]
    fn bet_memo_parses_race_and_runner() {
        assert_eq!(
            parse_bet_memo("bet:race_abc:2"),
            Some(("race_abc".to_string(), 2))
        );
        assert_eq!(
            parse_bet_memo("bet:race_abc:0:ref:XYZ"),
            Some(("race_abc".to_string(), 0))
        );
        assert_eq!(parse_bet_memo("deposit:race_abc:2"), None);
        assert_eq!(parse_bet_memo("bet:race_abc:notanumber"), None);
        assert_eq!(parse_bet_memo("bet:race_abc"), None);
    }
}
