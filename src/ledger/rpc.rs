//! JSON-RPC ledger transport.
//!
//! Read-side queries are fully implemented here. Submitting requires wire
//! bytes, and signing lives outside the orchestrator: a deployment injects a
//! `TxSigner` that turns a `TransferPlan` plus recent blockhash into a signed
//! base64 transaction.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::debug;

use crate::errors::{EngineError, EngineResult};

use super::{
    Commitment, LedgerRpc, RawInstruction, RawParsedTx, SigStatus, TokenBalance, TransferPlan,
};

/// Deployment-provided transaction signer. Holds the ephemeral process key;
/// the orchestrator never sees key material.
pub trait TxSigner: Send + Sync {
    /// Produce signed wire bytes (base64) for the plan.
    fn sign_transfers(&self, plan: &TransferPlan, recent_blockhash: &str)
        -> anyhow::Result<String>;
    /// The signature the signed transaction will carry.
    fn signature_of(&self, plan: &TransferPlan, recent_blockhash: &str) -> anyhow::Result<String>;
}

pub struct HttpLedgerRpc {
    client: reqwest::Client,
    url: String,
    signer: Option<Arc<dyn TxSigner>>,
}

impl HttpLedgerRpc {
    pub fn new(url: &str, signer: Option<Arc<dyn TxSigner>>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            signer,
        })
    }

    async fn call(&self, method: &str, params: Value) -> EngineResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::LedgerTransient(format!("{method}: {e}")))?;

        if resp.status().as_u16() == 429 {
            return Err(EngineError::LedgerTransient(format!("{method}: rate limited")));
        }
        if !resp.status().is_success() {
            return Err(EngineError::LedgerFatal(format!(
                "{method}: http {}",
                resp.status()
            )));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::LedgerTransient(format!("{method}: {e}")))?;

        if let Some(err) = payload.get("error") {
            let msg = err.to_string();
            // Expired blockhashes and node lag are retryable with a fresh send.
            let transient = msg.contains("BlockhashNotFound")
                || msg.contains("blockhash")
                || msg.contains("node is behind")
                || msg.contains("Too many requests");
            return Err(if transient {
                EngineError::LedgerTransient(format!("{method}: {msg}"))
            } else {
                EngineError::LedgerFatal(format!("{method}: {msg}"))
            });
        }

        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn latest_blockhash(&self, commitment: Commitment) -> EngineResult<String> {
        let result = self
            .call(
                "getLatestBlockhash",
                json!([{ "commitment": commitment.as_str() }]),
            )
            .await?;
        result["value"]["blockhash"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| EngineError::LedgerTransient("getLatestBlockhash: no blockhash".into()))
    }

    fn parse_tx_value(result: &Value) -> Option<RawParsedTx> {
        if result.is_null() {
            return None;
        }
        let slot = result["slot"].as_u64()?;
        let block_time_ms = result["blockTime"].as_i64().map(|s| s * 1000);
        let meta = &result["meta"];
        let message = &result["transaction"]["message"];

        let account_keys: Vec<String> = message["accountKeys"]
            .as_array()
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| {
                        k.as_str()
                            .map(|s| s.to_string())
                            .or_else(|| k["pubkey"].as_str().map(|s| s.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let lamports = |v: &Value| -> Vec<u64> {
            v.as_array()
                .map(|a| a.iter().filter_map(|x| x.as_u64()).collect())
                .unwrap_or_default()
        };

        let token_balances = |v: &Value| -> Vec<TokenBalance> {
            v.as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|b| {
                            Some(TokenBalance {
                                account_index: b["accountIndex"].as_u64()? as usize,
                                mint: b["mint"].as_str()?.to_string(),
                                owner: b["owner"].as_str().unwrap_or_default().to_string(),
                                ui_amount: b["uiTokenAmount"]["uiAmountString"]
                                    .as_str()
                                    .and_then(|s| Decimal::from_str(s).ok())
                                    .unwrap_or(Decimal::ZERO),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let instructions: Vec<RawInstruction> = message["instructions"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|ix| {
                        let program_id = ix["programId"].as_str()?.to_string();
                        Some(RawInstruction {
                            program_id,
                            data: ix["data"].as_str().map(|s| s.to_string()),
                            parsed: ix["parsed"].as_str().map(|s| s.to_string()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let log_messages: Vec<String> = meta["logMessages"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|l| l.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Some(RawParsedTx {
            slot,
            block_time_ms,
            account_keys,
            pre_lamports: lamports(&meta["preBalances"]),
            post_lamports: lamports(&meta["postBalances"]),
            pre_token: token_balances(&meta["preTokenBalances"]),
            post_token: token_balances(&meta["postTokenBalances"]),
            instructions,
            log_messages,
        })
    }
}

#[async_trait]
impl LedgerRpc for HttpLedgerRpc {
    async fn submit(&self, plan: &TransferPlan, commitment: Commitment) -> EngineResult<String> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            EngineError::LedgerFatal("no transaction signer configured for rpc mode".into())
        })?;

        let blockhash = self.latest_blockhash(commitment).await?;
        let wire = signer
            .sign_transfers(plan, &blockhash)
            .map_err(|e| EngineError::LedgerFatal(format!("signing failed: {e}")))?;
        let expected_sig = signer
            .signature_of(plan, &blockhash)
            .map_err(|e| EngineError::LedgerFatal(format!("signing failed: {e}")))?;

        let result = self
            .call(
                "sendTransaction",
                json!([wire, {
                    "encoding": "base64",
                    "preflightCommitment": commitment.as_str(),
                    "maxRetries": 0,
                }]),
            )
            .await?;

        let sig = result
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or(expected_sig);
        debug!(sig, "transaction submitted");
        Ok(sig)
    }

    async fn signature_statuses(&self, sigs: &[String]) -> EngineResult<Vec<Option<SigStatus>>> {
        let result = self
            .call(
                "getSignatureStatuses",
                json!([sigs, { "searchTransactionHistory": true }]),
            )
            .await?;

        Ok(result["value"]
            .as_array()
            .map(|a| {
                a.iter()
                    .map(|v| {
                        if v.is_null() {
                            None
                        } else {
                            Some(SigStatus {
                                slot: v["slot"].as_u64().unwrap_or(0),
                                err: (!v["err"].is_null()).then(|| v["err"].to_string()),
                                confirmation_status: v["confirmationStatus"]
                                    .as_str()
                                    .map(|s| s.to_string()),
                            })
                        }
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn parsed_transaction(&self, sig: &str) -> EngineResult<Option<RawParsedTx>> {
        let result = self
            .call(
                "getTransaction",
                json!([sig, {
                    "encoding": "jsonParsed",
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0,
                }]),
            )
            .await?;
        Ok(Self::parse_tx_value(&result))
    }

    async fn lamport_balance(&self, wallet: &str) -> EngineResult<u64> {
        let result = self.call("getBalance", json!([wallet])).await?;
        Ok(result["value"].as_u64().unwrap_or(0))
    }

    async fn token_balance(&self, wallet: &str, mint: &str) -> EngineResult<Decimal> {
        let result = self
            .call(
                "getTokenAccountsByOwner",
                json!([wallet, { "mint": mint }, { "encoding": "jsonParsed" }]),
            )
            .await?;

        let mut total = Decimal::ZERO;
        if let Some(accounts) = result["value"].as_array() {
            for acc in accounts {
                if let Some(s) = acc["account"]["data"]["parsed"]["info"]["tokenAmount"]
                    ["uiAmountString"]
                    .as_str()
                {
                    total += Decimal::from_str(s).unwrap_or(Decimal::ZERO);
                }
            }
        }
        Ok(total)
    }

    async fn has_token_account(&self, wallet: &str, mint: &str) -> EngineResult<bool> {
        let result = self
            .call(
                "getTokenAccountsByOwner",
                json!([wallet, { "mint": mint }, { "encoding": "jsonParsed" }]),
            )
            .await?;
        Ok(result["value"]
            .as_array()
            .map(|a| !a.is_empty())
            .unwrap_or(false))
    }

    async fn confirmed_slot(&self) -> EngineResult<u64> {
        let result = self
            .call("getSlot", json!([{ "commitment": "confirmed" }]))
            .await?;
        result
            .as_u64()
            .ok_or_else(|| EngineError::LedgerTransient("getSlot: no slot".into()))
    }

    async fn block_time_ms(&self, slot: u64) -> EngineResult<Option<i64>> {
        match self.call("getBlockTime", json!([slot])).await {
            Ok(result) => Ok(result.as_i64().map(|s| s * 1000)),
            // Nodes prune old block times; treat as missing rather than fail.
            Err(EngineError::LedgerFatal(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn signatures_for_address(
        &self,
        address: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        let result = self
            .call(
                "getSignaturesForAddress",
                json!([address, { "limit": limit }]),
            )
            .await?;
        Ok(result
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v["signature"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
