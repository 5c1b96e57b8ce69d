//! In-process simulated ledger.
//!
//! The default transport in paper mode and the workhorse of the test suite.
//! Applies transfers to in-memory balances, synthesizes parsed transactions
//! that mirror what the JSON-RPC transport would return, and offers fault
//! injection for the retry paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

use crate::errors::{EngineError, EngineResult};
use crate::models::now_wall_ms;

use super::{
    Commitment, LedgerRpc, RawInstruction, RawParsedTx, SigStatus, TokenBalance, TransferKind,
    TransferPlan, MEMO_PROGRAM_ID,
};

#[derive(Default)]
struct PaperState {
    lamports: HashMap<String, u64>,
    tokens: HashMap<(String, String), Decimal>,
    token_accounts: HashSet<(String, String)>,
    txs: HashMap<String, RawParsedTx>,
    /// Signatures touching an address, newest first.
    by_address: HashMap<String, Vec<String>>,
    sig_counter: u64,
    slot: u64,
    /// Remaining submits to fail, and whether as transient errors.
    fail_submits: u32,
    fail_transient: bool,
    /// When set, submits apply state and land on-chain but the call errors.
    ambiguous_submits: u32,
    parse_fetches: u64,
}

pub struct PaperLedger {
    state: Mutex<PaperState>,
}

impl Default for PaperLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                slot: 1_000,
                ..Default::default()
            }),
        }
    }

    pub fn credit_lamports(&self, wallet: &str, lamports: u64) {
        let mut s = self.state.lock();
        *s.lamports.entry(wallet.to_string()).or_default() += lamports;
    }

    pub fn credit_token(&self, wallet: &str, mint: &str, amount: Decimal) {
        let mut s = self.state.lock();
        *s.tokens
            .entry((wallet.to_string(), mint.to_string()))
            .or_insert(Decimal::ZERO) += amount;
        s.token_accounts
            .insert((wallet.to_string(), mint.to_string()));
    }

    pub fn lamports(&self, wallet: &str) -> u64 {
        self.state.lock().lamports.get(wallet).copied().unwrap_or(0)
    }

    pub fn token(&self, wallet: &str, mint: &str) -> Decimal {
        self.state
            .lock()
            .tokens
            .get(&(wallet.to_string(), mint.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Fail the next `n` submits; `transient` picks the error class.
    pub fn fail_submits(&self, n: u32, transient: bool) {
        let mut s = self.state.lock();
        s.fail_submits = n;
        s.fail_transient = transient;
    }

    /// The next `n` submits land on-chain but report an error to the caller.
    pub fn make_submits_ambiguous(&self, n: u32) {
        self.state.lock().ambiguous_submits = n;
    }

    pub fn parse_fetch_count(&self) -> u64 {
        self.state.lock().parse_fetches
    }

    /// Simulate a user paying the escrow directly (the transaction a wallet
    /// app would produce); returns its signature.
    pub fn simulate_user_lamport_transfer(
        &self,
        from: &str,
        to: &str,
        lamports: u64,
        memo: Option<&str>,
    ) -> String {
        let plan = TransferPlan {
            payer: from.to_string(),
            kind: TransferKind::Lamports {
                transfers: vec![super::LamportTransfer {
                    from: from.to_string(),
                    to: to.to_string(),
                    lamports,
                }],
            },
            memo: memo.map(|m| m.to_string()),
            dedup_key: None,
        };
        let mut s = self.state.lock();
        Self::apply(&mut s, &plan).expect("simulated transfer must apply")
    }

    pub fn simulate_user_spl_transfer(
        &self,
        from: &str,
        mint: &str,
        to: &str,
        amount: Decimal,
        memo: Option<&str>,
    ) -> String {
        let plan = TransferPlan {
            payer: from.to_string(),
            kind: TransferKind::Spl {
                mint: mint.to_string(),
                transfers: vec![super::SplTransfer {
                    from: from.to_string(),
                    to: to.to_string(),
                    amount,
                }],
                create_atas: vec![],
            },
            memo: memo.map(|m| m.to_string()),
            dedup_key: None,
        };
        let mut s = self.state.lock();
        Self::apply(&mut s, &plan).expect("simulated transfer must apply")
    }

    /// Apply a plan to balances and synthesize the parsed transaction.
    fn apply(s: &mut PaperState, plan: &TransferPlan) -> EngineResult<String> {
        // A keyed plan always resolves to the same signature; a re-send of an
        // already-landed transaction is a no-op returning the original.
        if let Some(key) = &plan.dedup_key {
            let sig = format!("paper_sig_{key}");
            if s.txs.contains_key(&sig) {
                return Ok(sig);
            }
        }

        s.slot += 1;
        let slot = s.slot;
        let block_time_ms = now_wall_ms();

        let mut account_keys: Vec<String> = Vec::new();
        let mut key_index = |keys: &mut Vec<String>, k: &str| -> usize {
            match keys.iter().position(|x| x == k) {
                Some(i) => i,
                None => {
                    keys.push(k.to_string());
                    keys.len() - 1
                }
            }
        };

        let mut pre_lamports: HashMap<usize, u64> = HashMap::new();
        let mut pre_token: Vec<TokenBalance> = Vec::new();
        let mut post_token: Vec<TokenBalance> = Vec::new();
        let mut touched: HashSet<String> = HashSet::new();

        match &plan.kind {
            TransferKind::Lamports { transfers } => {
                // Validate before mutating.
                let mut needed: HashMap<&str, u64> = HashMap::new();
                for t in transfers {
                    *needed.entry(t.from.as_str()).or_default() += t.lamports;
                }
                for (wallet, amount) in &needed {
                    let have = s.lamports.get(*wallet).copied().unwrap_or(0);
                    if have < *amount {
                        return Err(EngineError::InsufficientFunds(format!(
                            "{wallet} holds {have} lamports, needs {amount}"
                        )));
                    }
                }

                for t in transfers {
                    let fi = key_index(&mut account_keys, &t.from);
                    let ti = key_index(&mut account_keys, &t.to);
                    pre_lamports
                        .entry(fi)
                        .or_insert_with(|| s.lamports.get(&t.from).copied().unwrap_or(0));
                    pre_lamports
                        .entry(ti)
                        .or_insert_with(|| s.lamports.get(&t.to).copied().unwrap_or(0));
                    *s.lamports.entry(t.from.clone()).or_default() -= t.lamports;
                    *s.lamports.entry(t.to.clone()).or_default() += t.lamports;
                    touched.insert(t.from.clone());
                    touched.insert(t.to.clone());
                }
            }
            TransferKind::Spl {
                mint,
                transfers,
                create_atas,
            } => {
                let mut needed: HashMap<&str, Decimal> = HashMap::new();
                for t in transfers {
                    *needed.entry(t.from.as_str()).or_insert(Decimal::ZERO) += t.amount;
                }
                for (wallet, amount) in &needed {
                    let have = s
                        .tokens
                        .get(&(wallet.to_string(), mint.clone()))
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    if have < *amount {
                        return Err(EngineError::InsufficientFunds(format!(
                            "{wallet} holds {have} {mint}, needs {amount}"
                        )));
                    }
                }

                for owner in create_atas {
                    s.token_accounts.insert((owner.clone(), mint.clone()));
                }

                for t in transfers {
                    let fi = key_index(&mut account_keys, &t.from);
                    let ti = key_index(&mut account_keys, &t.to);
                    let pre_from = s
                        .tokens
                        .get(&(t.from.clone(), mint.clone()))
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    let pre_to = s
                        .tokens
                        .get(&(t.to.clone(), mint.clone()))
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    pre_token.push(TokenBalance {
                        account_index: fi,
                        mint: mint.clone(),
                        owner: t.from.clone(),
                        ui_amount: pre_from,
                    });
                    pre_token.push(TokenBalance {
                        account_index: ti,
                        mint: mint.clone(),
                        owner: t.to.clone(),
                        ui_amount: pre_to,
                    });

                    *s.tokens
                        .entry((t.from.clone(), mint.clone()))
                        .or_insert(Decimal::ZERO) -= t.amount;
                    *s.tokens
                        .entry((t.to.clone(), mint.clone()))
                        .or_insert(Decimal::ZERO) += t.amount;
                    s.token_accounts.insert((t.to.clone(), mint.clone()));

                    post_token.push(TokenBalance {
                        account_index: fi,
                        mint: mint.clone(),
                        owner: t.from.clone(),
                        ui_amount: pre_from - t.amount,
                    });
                    post_token.push(TokenBalance {
                        account_index: ti,
                        mint: mint.clone(),
                        owner: t.to.clone(),
                        ui_amount: pre_to + t.amount,
                    });
                    touched.insert(t.from.clone());
                    touched.insert(t.to.clone());
                }
            }
        }

        let pre: Vec<u64> = (0..account_keys.len())
            .map(|i| pre_lamports.get(&i).copied().unwrap_or(0))
            .collect();
        let post: Vec<u64> = account_keys
            .iter()
            .map(|k| s.lamports.get(k).copied().unwrap_or(0))
            .collect();

        let mut instructions = Vec::new();
        if let Some(memo) = &plan.memo {
            instructions.push(RawInstruction {
                program_id: MEMO_PROGRAM_ID.to_string(),
                data: Some(bs58::encode(memo.as_bytes()).into_string()),
                parsed: None,
            });
        }

        let sig = match &plan.dedup_key {
            Some(key) => format!("paper_sig_{key}"),
            None => {
                s.sig_counter += 1;
                format!("paper_sig_{}", s.sig_counter)
            }
        };

        s.txs.insert(
            sig.clone(),
            RawParsedTx {
                slot,
                block_time_ms: Some(block_time_ms),
                account_keys,
                pre_lamports: pre,
                post_lamports: post,
                pre_token,
                post_token,
                instructions,
                log_messages: vec![],
            },
        );
        for wallet in touched {
            s.by_address.entry(wallet).or_default().insert(0, sig.clone());
        }

        Ok(sig)
    }
}

#[async_trait]
impl LedgerRpc for PaperLedger {
    async fn submit(&self, plan: &TransferPlan, _commitment: Commitment) -> EngineResult<String> {
        let mut s = self.state.lock();

        if s.fail_submits > 0 {
            s.fail_submits -= 1;
            return Err(if s.fail_transient {
                EngineError::LedgerTransient("simulated transient failure".into())
            } else {
                EngineError::LedgerFatal("simulated fatal failure".into())
            });
        }

        if s.ambiguous_submits > 0 {
            s.ambiguous_submits -= 1;
            let _sig = Self::apply(&mut s, plan)?;
            return Err(EngineError::LedgerTransient(
                "simulated timeout after send".into(),
            ));
        }

        Self::apply(&mut s, plan)
    }

    async fn signature_statuses(&self, sigs: &[String]) -> EngineResult<Vec<Option<SigStatus>>> {
        let s = self.state.lock();
        Ok(sigs
            .iter()
            .map(|sig| {
                s.txs.get(sig).map(|tx| SigStatus {
                    slot: tx.slot,
                    err: None,
                    confirmation_status: Some("confirmed".into()),
                })
            })
            .collect())
    }

    async fn parsed_transaction(&self, sig: &str) -> EngineResult<Option<RawParsedTx>> {
        let mut s = self.state.lock();
        s.parse_fetches += 1;
        Ok(s.txs.get(sig).cloned())
    }

    async fn lamport_balance(&self, wallet: &str) -> EngineResult<u64> {
        Ok(self.lamports(wallet))
    }

    async fn token_balance(&self, wallet: &str, mint: &str) -> EngineResult<Decimal> {
        Ok(self.token(wallet, mint))
    }

    async fn has_token_account(&self, wallet: &str, mint: &str) -> EngineResult<bool> {
        Ok(self
            .state
            .lock()
            .token_accounts
            .contains(&(wallet.to_string(), mint.to_string())))
    }

    async fn confirmed_slot(&self) -> EngineResult<u64> {
        Ok(self.state.lock().slot)
    }

    async fn block_time_ms(&self, _slot: u64) -> EngineResult<Option<i64>> {
        Ok(Some(now_wall_ms()))
    }

    async fn signatures_for_address(
        &self,
        address: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        let s = self.state.lock();
        Ok(s.by_address
            .get(address)
            .map(|v| v.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn apply_moves_lamports_and_records_tx() {
        let paper = PaperLedger::new();
        paper.credit_lamports("a", 10_000);

        let sig = paper.simulate_user_lamport_transfer("a", "b", 4_000, Some("memo!"));
        assert_eq!(paper.lamports("a"), 6_000);
        assert_eq!(paper.lamports("b"), 4_000);

        let tx = paper.parsed_transaction(&sig).await.unwrap().unwrap();
        assert_eq!(super::super::verify::lamport_delta(&tx, "b"), 4_000);
        assert_eq!(
            super::super::verify::extract_memo(&tx).as_deref(),
            Some("memo!")
        );
    }

    #[tokio::test]
    async fn ambiguous_submit_lands_but_errors() {
        let paper = PaperLedger::new();
        paper.credit_token("a", "M", Decimal::from_str("5").unwrap());
        paper.make_submits_ambiguous(1);

        let plan = TransferPlan {
            payer: "a".into(),
            kind: TransferKind::Spl {
                mint: "M".into(),
                transfers: vec![super::super::SplTransfer {
                    from: "a".into(),
                    to: "b".into(),
                    amount: Decimal::from_str("5").unwrap(),
                }],
                create_atas: vec![],
            },
            memo: None,
            dedup_key: None,
        };
        let err = paper.submit(&plan, Commitment::Confirmed).await.unwrap_err();
        assert!(err.is_transient());
        // State changed anyway: the transfer landed.
        assert_eq!(paper.token("b", "M"), Decimal::from_str("5").unwrap());
    }

    #[tokio::test]
    async fn signatures_for_address_is_newest_first() {
        let paper = PaperLedger::new();
        paper.credit_lamports("a", 10_000);
        let s1 = paper.simulate_user_lamport_transfer("a", "b", 1, None);
        let s2 = paper.simulate_user_lamport_transfer("a", "b", 2, None);
        let sigs = paper.signatures_for_address("b", 10).await.unwrap();
        assert_eq!(sigs, vec![s2, s1]);
    }
}
