//! Ledger access: the raw RPC transport contract and the client logic layered
//! on top of it (retry ladder, confirmation, parsed-transaction memoization,
//! transfer batching, verification).

pub mod paper;
pub mod rpc;
pub mod verify;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};

pub use paper::PaperLedger;
pub use rpc::{HttpLedgerRpc, TxSigner};

pub const MEMO_PROGRAM_ID: &str = "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr";
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;
/// Hard cap on transfers per wire transaction.
pub const MAX_BATCH_TRANSFERS: usize = 5;

const SEND_MAX_ATTEMPTS: u32 = 4;
const PARSE_CACHE_CAP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }

    /// Commitment rotation across retry attempts.
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt % 3 {
            0 => Commitment::Confirmed,
            1 => Commitment::Processed,
            _ => Commitment::Finalized,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LamportTransfer {
    pub from: String,
    pub to: String,
    pub lamports: u64,
}

#[derive(Debug, Clone)]
pub struct SplTransfer {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub enum TransferKind {
    Lamports {
        transfers: Vec<LamportTransfer>,
    },
    Spl {
        mint: String,
        transfers: Vec<SplTransfer>,
        /// Recipient owners whose associated token account must be created
        /// first, payer = plan payer.
        create_atas: Vec<String>,
    },
}

/// One wire transaction worth of transfers.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub payer: String,
    pub kind: TransferKind,
    pub memo: Option<String>,
    /// Stable client-side key; a re-send of the same plan resolves to the
    /// same on-chain signature, so re-confirmation after a crash finds the
    /// original transaction.
    pub dedup_key: Option<String>,
}

impl TransferPlan {
    pub fn transfer_count(&self) -> usize {
        match &self.kind {
            TransferKind::Lamports { transfers } => transfers.len(),
            TransferKind::Spl { transfers, .. } => transfers.len(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SigStatus {
    pub slot: u64,
    pub err: Option<String>,
    pub confirmation_status: Option<String>,
}

impl SigStatus {
    pub fn is_landed(&self) -> bool {
        self.err.is_none()
            && matches!(
                self.confirmation_status.as_deref(),
                Some("confirmed") | Some("finalized")
            )
    }
}

/// Token balance entry from transaction metadata.
#[derive(Debug, Clone)]
pub struct TokenBalance {
    pub account_index: usize,
    pub mint: String,
    pub owner: String,
    pub ui_amount: Decimal,
}

/// Raw instruction as surfaced by the parsed-transaction endpoint.
#[derive(Debug, Clone)]
pub struct RawInstruction {
    pub program_id: String,
    /// Base58 or base64 instruction data, when present.
    pub data: Option<String>,
    /// Pre-decoded text for instructions the RPC node parses itself.
    pub parsed: Option<String>,
}

/// Normalized parsed transaction; produced by every transport.
#[derive(Debug, Clone)]
pub struct RawParsedTx {
    pub slot: u64,
    pub block_time_ms: Option<i64>,
    pub account_keys: Vec<String>,
    pub pre_lamports: Vec<u64>,
    pub post_lamports: Vec<u64>,
    pub pre_token: Vec<TokenBalance>,
    pub post_token: Vec<TokenBalance>,
    pub instructions: Vec<RawInstruction>,
    pub log_messages: Vec<String>,
}

/// One matched transfer inside a parsed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTransfer {
    pub mint: String,
    pub sender: String,
    pub recipient: String,
    pub amount: Decimal,
}

/// Public parse result.
#[derive(Debug, Clone)]
pub struct ParsedTx {
    pub transfers: Vec<ParsedTransfer>,
    pub memo: Option<String>,
    pub slot: u64,
    pub block_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub memo: Option<String>,
    pub slot: Option<u64>,
    pub block_time_ms: Option<i64>,
    pub transfers: Vec<ParsedTransfer>,
}

/// Raw transport contract. Implementations: JSON-RPC (`HttpLedgerRpc`) and the
/// in-process simulator (`PaperLedger`).
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Sign and submit one transaction; returns its signature. Does not wait
    /// for confirmation.
    async fn submit(&self, plan: &TransferPlan, commitment: Commitment) -> EngineResult<String>;

    async fn signature_statuses(&self, sigs: &[String]) -> EngineResult<Vec<Option<SigStatus>>>;

    async fn parsed_transaction(&self, sig: &str) -> EngineResult<Option<RawParsedTx>>;

    async fn lamport_balance(&self, wallet: &str) -> EngineResult<u64>;

    async fn token_balance(&self, wallet: &str, mint: &str) -> EngineResult<Decimal>;

    async fn has_token_account(&self, wallet: &str, mint: &str) -> EngineResult<bool>;

    async fn confirmed_slot(&self) -> EngineResult<u64>;

    /// Block time in epoch milliseconds, when the ledger knows it.
    async fn block_time_ms(&self, slot: u64) -> EngineResult<Option<i64>>;

    async fn signatures_for_address(
        &self,
        address: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>>;
}

struct ParseCache {
    map: HashMap<String, Arc<ParsedTx>>,
    order: VecDeque<String>,
}

impl ParseCache {
    fn get(&mut self, sig: &str) -> Option<Arc<ParsedTx>> {
        self.map.get(sig).cloned()
    }

    fn insert(&mut self, sig: String, tx: Arc<ParsedTx>) {
        if self.map.insert(sig.clone(), tx).is_none() {
            self.order.push_back(sig);
        }
        while self.order.len() > PARSE_CACHE_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }
}

/// Ledger client: everything above the raw transport.
pub struct LedgerClient {
    rpc: Arc<dyn LedgerRpc>,
    parse_cache: Mutex<ParseCache>,
    parse_in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl LedgerClient {
    pub fn new(rpc: Arc<dyn LedgerRpc>) -> Self {
        Self {
            rpc,
            parse_cache: Mutex::new(ParseCache {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            parse_in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn rpc(&self) -> &Arc<dyn LedgerRpc> {
        &self.rpc
    }

    /// Submit with a bounded retry ladder and confirm. On an ambiguous send
    /// outcome the signature-status query decides: a landed signature is a
    /// success even when the submit call itself errored.
    pub async fn send_with_retry(&self, plan: &TransferPlan) -> EngineResult<String> {
        let mut last_sig: Option<String> = None;
        let mut last_err: Option<EngineError> = None;

        for attempt in 0..SEND_MAX_ATTEMPTS {
            let commitment = Commitment::for_attempt(attempt);
            match self.rpc.submit(plan, commitment).await {
                Ok(sig) => match self.confirm(&sig).await {
                    Ok(true) => return Ok(sig),
                    Ok(false) => {
                        last_sig = Some(sig);
                        last_err = Some(EngineError::LedgerTransient(
                            "transaction not confirmed".into(),
                        ));
                    }
                    Err(e) => {
                        last_sig = Some(sig);
                        last_err = Some(e);
                    }
                },
                Err(e) if e.is_transient() => {
                    debug!(attempt, error = %e, "transient send failure, retrying");
                    last_err = Some(e);
                }
                Err(e) => {
                    // A fatal submit error can still mean the transaction
                    // landed; re-check before giving up.
                    if let Some(sig) = &last_sig {
                        if self.confirm(sig).await.unwrap_or(false) {
                            return Ok(sig.clone());
                        }
                    }
                    return Err(e);
                }
            }

            tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
        }

        // Final ambiguity resolution across all attempts.
        if let Some(sig) = last_sig {
            if self.confirm(&sig).await.unwrap_or(false) {
                return Ok(sig);
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::LedgerTransient("send exhausted".into())))
    }

    /// True iff the ledger reports the signature confirmed or finalized.
    pub async fn confirm(&self, sig: &str) -> EngineResult<bool> {
        let statuses = self.rpc.signature_statuses(&[sig.to_string()]).await?;
        Ok(statuses
            .first()
            .and_then(|s| s.as_ref())
            .map(|s| s.is_landed())
            .unwrap_or(false))
    }

    /// Memoized parsed-transaction fetch with in-flight de-duplication.
    pub async fn parse_tx(&self, sig: &str) -> EngineResult<Option<ParsedTx>> {
        loop {
            if let Some(hit) = self.parse_cache.lock().get(sig) {
                return Ok(Some((*hit).clone()));
            }

            let waiter = {
                let mut in_flight = self.parse_in_flight.lock();
                match in_flight.get(sig) {
                    Some(n) => Some(n.clone()),
                    None => {
                        in_flight.insert(sig.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            if let Some(n) = waiter {
                n.notified().await;
                continue;
            }

            let fetched = self.fetch_and_normalize(sig).await;

            let notify = self
                .parse_in_flight
                .lock()
                .remove(sig)
                .unwrap_or_else(|| Arc::new(Notify::new()));
            notify.notify_waiters();

            return fetched;
        }
    }

    async fn fetch_and_normalize(&self, sig: &str) -> EngineResult<Option<ParsedTx>> {
        let raw = match self.rpc.parsed_transaction(sig).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let parsed = ParsedTx {
            transfers: verify::match_spl_transfers(&raw),
            memo: verify::extract_memo(&raw),
            slot: raw.slot,
            block_time_ms: raw.block_time_ms,
        };

        self.parse_cache
            .lock()
            .insert(sig.to_string(), Arc::new(parsed.clone()));
        Ok(Some(parsed))
    }

    pub async fn send_lamports(
        &self,
        from: &str,
        to: &str,
        lamports: u64,
        memo: Option<String>,
    ) -> EngineResult<String> {
        self.batch_send_lamports(
            from,
            &[LamportTransfer {
                from: from.to_string(),
                to: to.to_string(),
                lamports,
            }],
            memo,
        )
        .await
    }

    pub async fn send_spl_checked(
        &self,
        from: &str,
        mint: &str,
        to: &str,
        amount: Decimal,
        memo: Option<String>,
    ) -> EngineResult<String> {
        self.batch_send_spl(
            from,
            mint,
            &[SplTransfer {
                from: from.to_string(),
                to: to.to_string(),
                amount,
            }],
            memo,
        )
        .await
    }

    pub async fn batch_send_lamports(
        &self,
        payer: &str,
        transfers: &[LamportTransfer],
        memo: Option<String>,
    ) -> EngineResult<String> {
        self.batch_send_lamports_keyed(payer, transfers, memo, None)
            .await
    }

    pub async fn batch_send_lamports_keyed(
        &self,
        payer: &str,
        transfers: &[LamportTransfer],
        memo: Option<String>,
        dedup_key: Option<String>,
    ) -> EngineResult<String> {
        if transfers.is_empty() || transfers.len() > MAX_BATCH_TRANSFERS {
            return Err(EngineError::LedgerFatal(format!(
                "lamport batch size {} outside 1..={}",
                transfers.len(),
                MAX_BATCH_TRANSFERS
            )));
        }

        let needed: u64 = transfers.iter().map(|t| t.lamports).sum();
        let available = self.rpc.lamport_balance(payer).await?;
        if available < needed {
            return Err(EngineError::InsufficientFunds(format!(
                "{payer} holds {available} lamports, needs {needed}"
            )));
        }

        let plan = TransferPlan {
            payer: payer.to_string(),
            kind: TransferKind::Lamports {
                transfers: transfers.to_vec(),
            },
            memo,
            dedup_key,
        };
        self.send_with_retry(&plan).await
    }

    pub async fn batch_send_spl(
        &self,
        payer: &str,
        mint: &str,
        transfers: &[SplTransfer],
        memo: Option<String>,
    ) -> EngineResult<String> {
        self.batch_send_spl_keyed(payer, mint, transfers, memo, None)
            .await
    }

    pub async fn batch_send_spl_keyed(
        &self,
        payer: &str,
        mint: &str,
        transfers: &[SplTransfer],
        memo: Option<String>,
        dedup_key: Option<String>,
    ) -> EngineResult<String> {
        if transfers.is_empty() || transfers.len() > MAX_BATCH_TRANSFERS {
            return Err(EngineError::LedgerFatal(format!(
                "spl batch size {} outside 1..={}",
                transfers.len(),
                MAX_BATCH_TRANSFERS
            )));
        }

        let needed: Decimal = transfers.iter().map(|t| t.amount).sum();
        let available = self.rpc.token_balance(payer, mint).await?;
        if available < needed {
            return Err(EngineError::InsufficientFunds(format!(
                "{payer} holds {available} {mint}, needs {needed}"
            )));
        }

        // Recipient ATAs are created in the same transaction, payer-funded.
        let mut create_atas = Vec::new();
        for t in transfers {
            if !self.rpc.has_token_account(&t.to, mint).await? {
                create_atas.push(t.to.clone());
            }
        }
        if !create_atas.is_empty() {
            debug!(mint, count = create_atas.len(), "creating recipient ATAs");
        }

        let plan = TransferPlan {
            payer: payer.to_string(),
            kind: TransferKind::Spl {
                mint: mint.to_string(),
                transfers: transfers.to_vec(),
                create_atas,
            },
            memo,
            dedup_key,
        };
        self.send_with_retry(&plan).await
    }

    /// Verify a user-submitted SPL transfer. `expected_amount == 0` accepts
    /// any positive amount.
    pub async fn verify_spl_transfer(
        &self,
        sig: &str,
        expected_mint: &str,
        expected_recipient: &str,
        expected_amount: Decimal,
        expected_sender: Option<&str>,
    ) -> EngineResult<VerifyOutcome> {
        let parsed = match self.parse_tx(sig).await? {
            Some(p) => p,
            None => return Ok(VerifyOutcome::default()),
        };

        let matched = parsed.transfers.iter().any(|t| {
            t.mint == expected_mint
                && t.recipient == expected_recipient
                && (expected_amount.is_zero() || t.amount == expected_amount)
                && expected_sender.map(|s| t.sender == s).unwrap_or(true)
        });

        Ok(VerifyOutcome {
            valid: matched,
            memo: parsed.memo,
            slot: Some(parsed.slot),
            block_time_ms: parsed.block_time_ms,
            transfers: parsed.transfers,
        })
    }

    /// Verify a native transfer by pre/post lamport deltas.
    pub async fn verify_sol_transfer(
        &self,
        sig: &str,
        expected_recipient: &str,
        expected_lamports: u64,
        expected_sender: Option<&str>,
    ) -> EngineResult<VerifyOutcome> {
        let raw = match self.rpc.parsed_transaction(sig).await? {
            Some(raw) => raw,
            None => return Ok(VerifyOutcome::default()),
        };

        let recipient_delta = verify::lamport_delta(&raw, expected_recipient);
        let mut valid = if expected_lamports == 0 {
            recipient_delta > 0
        } else {
            recipient_delta == expected_lamports as i128
        };

        if valid {
            if let Some(sender) = expected_sender {
                // Sender loses at least the transferred amount (fees on top).
                let sender_delta = verify::lamport_delta(&raw, sender);
                if sender_delta > -(expected_lamports as i128) {
                    warn!(sig, sender, delta = sender_delta, "sender delta too small");
                    valid = false;
                }
            }
        }

        Ok(VerifyOutcome {
            valid,
            memo: verify::extract_memo(&raw),
            slot: Some(raw.slot),
            block_time_ms: raw.block_time_ms,
            transfers: verify::match_spl_transfers(&raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::paper::PaperLedger;
    use std::str::FromStr;

    fn client_with_paper() -> (LedgerClient, Arc<PaperLedger>) {
        let paper = Arc::new(PaperLedger::new());
        (LedgerClient::new(paper.clone()), paper)
    }

    #[tokio::test]
    async fn send_lamports_checks_balance() {
        let (client, paper) = client_with_paper();
        paper.credit_lamports("alice", 1_000);

        let err = client
            .send_lamports("alice", "bob", 5_000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds(_)));

        paper.credit_lamports("alice", 10_000);
        let sig = client
            .send_lamports("alice", "bob", 5_000, None)
            .await
            .unwrap();
        assert!(client.confirm(&sig).await.unwrap());
        assert_eq!(paper.lamports("bob"), 5_000);
    }

    #[tokio::test]
    async fn batch_size_is_capped() {
        let (client, paper) = client_with_paper();
        paper.credit_lamports("payer", u64::MAX / 2);
        let transfers: Vec<LamportTransfer> = (0..6)
            .map(|i| LamportTransfer {
                from: "payer".into(),
                to: format!("w{i}"),
                lamports: 1,
            })
            .collect();
        let err = client
            .batch_send_lamports("payer", &transfers, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LedgerFatal(_)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (client, paper) = client_with_paper();
        paper.credit_lamports("alice", 10_000);
        paper.fail_submits(2, true);

        let sig = client
            .send_lamports("alice", "bob", 1_000, None)
            .await
            .unwrap();
        assert!(client.confirm(&sig).await.unwrap());
    }

    #[tokio::test]
    async fn spl_send_verifies_round_trip() {
        let (client, paper) = client_with_paper();
        let amount = Decimal::from_str("42.5").unwrap();
        paper.credit_token("alice", "MINT1", amount);

        let sig = client
            .send_spl_checked("alice", "MINT1", "bob", amount, Some("hi".into()))
            .await
            .unwrap();

        let outcome = client
            .verify_spl_transfer(&sig, "MINT1", "bob", amount, Some("alice"))
            .await
            .unwrap();
        assert!(outcome.valid);
        assert_eq!(outcome.memo.as_deref(), Some("hi"));

        // Wrong mint fails closed.
        let outcome = client
            .verify_spl_transfer(&sig, "MINT2", "bob", amount, None)
            .await
            .unwrap();
        assert!(!outcome.valid);
    }

    #[tokio::test]
    async fn parse_cache_deduplicates_fetches(){
        let (client, paper) = client_with_paper();
        paper.credit_lamports("alice", 10_000);
        let sig = client
            .send_lamports("alice", "bob", 1_000, None)
            .await
            .unwrap();

        let first = client.parse_tx(&sig).await.unwrap().unwrap();
        let fetches_after_first = paper.parse_fetch_count();
        let second = client.parse_tx(&sig).await.unwrap().unwrap();
        assert_eq!(paper.parse_fetch_count(), fetches_after_first);
        assert_eq!(first.slot, second.slot);
    }
}
