//! Parsed-transaction analysis: SPL transfer matching by pre/post balance
//! deltas and memo extraction.
//!
//! Matching never relies on instruction data shape; balances are the source
//! of truth. The only program id we recognize is the memo program.

use base64::Engine;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::{ParsedTransfer, RawParsedTx, MEMO_PROGRAM_ID};

/// Index pre/post token balances by `(accountIndex, mint)`, fold into
/// per-`(owner, mint)` deltas, then greedy-match senders (negative delta) to
/// recipients (positive delta) by exact magnitude.
pub fn match_spl_transfers(raw: &RawParsedTx) -> Vec<ParsedTransfer> {
    // (account_index, mint) -> (owner, pre, post)
    let mut accounts: HashMap<(usize, &str), (&str, Decimal, Decimal)> = HashMap::new();

    for b in &raw.pre_token {
        let e = accounts
            .entry((b.account_index, b.mint.as_str()))
            .or_insert((b.owner.as_str(), Decimal::ZERO, Decimal::ZERO));
        e.1 = b.ui_amount;
    }
    for b in &raw.post_token {
        let e = accounts
            .entry((b.account_index, b.mint.as_str()))
            .or_insert((b.owner.as_str(), Decimal::ZERO, Decimal::ZERO));
        e.0 = b.owner.as_str();
        e.2 = b.ui_amount;
    }

    // Fold to per-(owner, mint) deltas; one owner can hold several accounts.
    let mut deltas: HashMap<(String, String), Decimal> = HashMap::new();
    for ((_, mint), (owner, pre, post)) in accounts {
        *deltas
            .entry((owner.to_string(), mint.to_string()))
            .or_insert(Decimal::ZERO) += post - pre;
    }

    let mut senders: Vec<(String, String, Decimal)> = Vec::new();
    let mut recipients: Vec<(String, String, Decimal)> = Vec::new();
    for ((owner, mint), delta) in deltas {
        if delta < Decimal::ZERO {
            senders.push((owner, mint, -delta));
        } else if delta > Decimal::ZERO {
            recipients.push((owner, mint, delta));
        }
    }
    // Deterministic match order regardless of map iteration.
    senders.sort();
    recipients.sort();

    let mut transfers = Vec::new();
    let mut taken = vec![false; recipients.len()];
    for (sender, mint, magnitude) in senders {
        for (i, (recipient, r_mint, r_amount)) in recipients.iter().enumerate() {
            if taken[i] || *r_mint != mint || *r_amount != magnitude {
                continue;
            }
            taken[i] = true;
            transfers.push(ParsedTransfer {
                mint: mint.clone(),
                sender: sender.clone(),
                recipient: recipient.clone(),
                amount: magnitude,
            });
            break;
        }
    }
    transfers
}

/// Net lamport delta for a wallet across the transaction.
pub fn lamport_delta(raw: &RawParsedTx, wallet: &str) -> i128 {
    raw.account_keys
        .iter()
        .position(|k| k == wallet)
        .map(|i| {
            let pre = raw.pre_lamports.get(i).copied().unwrap_or(0) as i128;
            let post = raw.post_lamports.get(i).copied().unwrap_or(0) as i128;
            post - pre
        })
        .unwrap_or(0)
}

/// Extract the memo string: decoded instruction data first (bs58, then
/// base64), then the program-log fallback.
pub fn extract_memo(raw: &RawParsedTx) -> Option<String> {
    for ix in &raw.instructions {
        if ix.program_id != MEMO_PROGRAM_ID {
            continue;
        }
        if let Some(text) = &ix.parsed {
            if !text.is_empty() {
                return Some(text.clone());
            }
        }
        if let Some(data) = &ix.data {
            if let Some(memo) = decode_memo_data(data) {
                return Some(memo);
            }
        }
    }
    memo_from_logs(&raw.log_messages)
}

/// Try the small fixed list of decoders in order; first valid UTF-8 wins.
pub fn decode_memo_data(data: &str) -> Option<String> {
    if let Ok(bytes) = bs58::decode(data).into_vec() {
        if let Ok(s) = String::from_utf8(bytes) {
            if !s.is_empty() {
                return Some(s);
            }
        }
    }
    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data) {
        if let Ok(s) = String::from_utf8(bytes) {
            if !s.is_empty() {
                return Some(s);
            }
        }
    }
    None
}

/// `Program log: Memo (len 5): "hello"`
fn memo_from_logs(logs: &[String]) -> Option<String> {
    for log in logs {
        if let Some(rest) = log.strip_prefix("Program log: Memo (len ") {
            if let Some(start) = rest.find("): \"") {
                let body = &rest[start + 4..];
                if let Some(end) = body.rfind('"') {
                    return Some(body[..end].to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{RawInstruction, TokenBalance};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn token(account_index: usize, mint: &str, owner: &str, amount: &str) -> TokenBalance {
        TokenBalance {
            account_index,
            mint: mint.into(),
            owner: owner.into(),
            ui_amount: dec(amount),
        }
    }

    fn empty_tx() -> RawParsedTx {
        RawParsedTx {
            slot: 1,
            block_time_ms: Some(1_700_000_000_000),
            account_keys: vec![],
            pre_lamports: vec![],
            post_lamports: vec![],
            pre_token: vec![],
            post_token: vec![],
            instructions: vec![],
            log_messages: vec![],
        }
    }

    #[test]
    fn matches_single_spl_transfer() {
        let mut tx = empty_tx();
        tx.pre_token = vec![
            token(1, "MINT", "alice", "100"),
            token(2, "MINT", "bob", "0"),
        ];
        tx.post_token = vec![
            token(1, "MINT", "alice", "60"),
            token(2, "MINT", "bob", "40"),
        ];

        let transfers = match_spl_transfers(&tx);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].sender, "alice");
        assert_eq!(transfers[0].recipient, "bob");
        assert_eq!(transfers[0].amount, dec("40"));
    }

    #[test]
    fn greedy_match_pairs_by_exact_magnitude() {
        let mut tx = empty_tx();
        tx.pre_token = vec![
            token(1, "MINT", "a", "50"),
            token(2, "MINT", "b", "30"),
            token(3, "MINT", "c", "0"),
            token(4, "MINT", "d", "0"),
        ];
        tx.post_token = vec![
            token(1, "MINT", "a", "30"),
            token(2, "MINT", "b", "0"),
            token(3, "MINT", "c", "30"),
            token(4, "MINT", "d", "20"),
        ];

        let transfers = match_spl_transfers(&tx);
        assert_eq!(transfers.len(), 2);
        assert!(transfers
            .iter()
            .any(|t| t.sender == "a" && t.recipient == "d" && t.amount == dec("20")));
        assert!(transfers
            .iter()
            .any(|t| t.sender == "b" && t.recipient == "c" && t.amount == dec("30")));
    }

    #[test]
    fn owner_with_two_accounts_nets_out() {
        // Same owner moving between their own accounts produces no transfer.
        let mut tx = empty_tx();
        tx.pre_token = vec![
            token(1, "MINT", "alice", "10"),
            token(2, "MINT", "alice", "0"),
        ];
        tx.post_token = vec![
            token(1, "MINT", "alice", "0"),
            token(2, "MINT", "alice", "10"),
        ];
        assert!(match_spl_transfers(&tx).is_empty());
    }

    #[test]
    fn lamport_delta_reads_pre_post() {
        let mut tx = empty_tx();
        tx.account_keys = vec!["alice".into(), "bob".into()];
        tx.pre_lamports = vec![1_000, 0];
        tx.post_lamports = vec![400, 500];
        assert_eq!(lamport_delta(&tx, "alice"), -600);
        assert_eq!(lamport_delta(&tx, "bob"), 500);
        assert_eq!(lamport_delta(&tx, "nobody"), 0);
    }

    #[test]
    fn memo_decodes_bs58_then_base64_then_logs() {
        let memo = "bet:race1:2";

        let mut tx = empty_tx();
        tx.instructions = vec![RawInstruction {
            program_id: MEMO_PROGRAM_ID.into(),
            data: Some(bs58::encode(memo.as_bytes()).into_string()),
            parsed: None,
        }];
        assert_eq!(extract_memo(&tx).as_deref(), Some(memo));

        let mut tx = empty_tx();
        tx.instructions = vec![RawInstruction {
            program_id: MEMO_PROGRAM_ID.into(),
            data: Some(base64::engine::general_purpose::STANDARD.encode(memo.as_bytes())),
            parsed: None,
        }];
        assert_eq!(extract_memo(&tx).as_deref(), Some(memo));

        let mut tx = empty_tx();
        tx.log_messages = vec![format!("Program log: Memo (len {}): \"{memo}\"", memo.len())];
        assert_eq!(extract_memo(&tx).as_deref(), Some(memo));
    }

    #[test]
    fn non_memo_instruction_data_is_ignored() {
        let mut tx = empty_tx();
        tx.instructions = vec![RawInstruction {
            program_id: "SomeOtherProgram".into(),
            data: Some(bs58::encode(b"not a memo").into_string()),
            parsed: None,
        }];
        assert_eq!(extract_memo(&tx), None);
    }
}
