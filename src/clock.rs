//! Drift-corrected clock bound to ledger block time.
//!
//! `now_ms()` never fails and never blocks: it applies the last observed
//! drift to the local clock. Sampling runs in the background and is coalesced
//! so at most one RPC round-trip is in flight at a time.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::ledger::LedgerRpc;
use crate::models::now_wall_ms;

#[derive(Debug, Clone, Copy, Default)]
pub struct ClockSnapshot {
    pub drift_ms: i64,
    pub last_slot: u64,
    pub last_block_time_ms: i64,
    pub last_sampled_at_ms: i64,
}

pub struct ChainClock {
    rpc: Arc<dyn LedgerRpc>,
    refresh_interval_ms: u64,
    min_interval_ms: u64,
    state: Mutex<ClockSnapshot>,
    /// Coalesces concurrent samples; waiters queue on this and re-check.
    sample_gate: AsyncMutex<()>,
}

impl ChainClock {
    pub fn new(rpc: Arc<dyn LedgerRpc>, refresh_interval_ms: u64, min_interval_ms: u64) -> Self {
        Self {
            rpc,
            refresh_interval_ms,
            min_interval_ms: min_interval_ms.max(1),
            state: Mutex::new(ClockSnapshot::default()),
            sample_gate: AsyncMutex::new(()),
        }
    }

    /// Local wall time corrected by the last observed drift.
    pub fn now_ms(&self) -> i64 {
        now_wall_ms() + self.state.lock().drift_ms
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        *self.state.lock()
    }

    /// Last confirmed block time, when one was ever observed.
    pub fn last_block_time_ms(&self) -> Option<i64> {
        let s = self.state.lock();
        (s.last_block_time_ms > 0).then_some(s.last_block_time_ms)
    }

    /// Sample if the refresh interval elapsed. Concurrent callers share one
    /// sample: whoever holds the gate fetches, the rest see a fresh
    /// `last_sampled_at_ms` and return immediately.
    pub async fn refresh(&self) {
        if !self.due(self.refresh_interval_ms) {
            return;
        }

        let _gate = self.sample_gate.lock().await;
        // Re-check under the gate; a racing caller may have just sampled.
        if !self.due(self.min_interval_ms) {
            return;
        }
        self.sample_once().await;
    }

    fn due(&self, interval_ms: u64) -> bool {
        let s = self.state.lock();
        now_wall_ms() - s.last_sampled_at_ms >= interval_ms as i64
    }

    async fn sample_once(&self) {
        let sampled_at = now_wall_ms();

        let outcome = async {
            let slot = self.rpc.confirmed_slot().await?;
            let block_time = self.rpc.block_time_ms(slot).await?;
            Ok::<_, crate::errors::EngineError>((slot, block_time))
        }
        .await;

        let mut s = self.state.lock();
        // Rate-limit retries regardless of outcome.
        s.last_sampled_at_ms = sampled_at;

        match outcome {
            Ok((slot, Some(block_time_ms))) => {
                let local = now_wall_ms();
                s.drift_ms = block_time_ms - local;
                s.last_slot = slot;
                s.last_block_time_ms = block_time_ms;
                debug!(slot, drift_ms = s.drift_ms, "chain clock sampled");
            }
            Ok((slot, None)) => {
                // Keep the prior drift; a missing block time is not an error
                // worth degrading over.
                s.last_slot = slot;
                debug!(slot, "block time unavailable, drift retained");
            }
            Err(e) => {
                warn!(error = %e, "chain clock sample failed, drift retained");
            }
        }
    }

    /// Background refresh loop; spawn once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.refresh_interval_ms.max(self.min_interval_ms),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.refresh().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{EngineError, EngineResult};
    use crate::ledger::{
        Commitment, RawParsedTx, SigStatus, TransferPlan,
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

    /// Minimal transport: serves a configurable slot/block time and counts calls.
    struct StubRpc {
        slot: AtomicU64,
        block_offset_ms: AtomicI64,
        fail: std::sync::atomic::AtomicBool,
        calls: AtomicU64,
    }

    impl StubRpc {
        fn new(offset_ms: i64) -> Self {
            Self {
                slot: AtomicU64::new(100),
                block_offset_ms: AtomicI64::new(offset_ms),
                fail: std::sync::atomic::AtomicBool::new(false),
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl crate::ledger::LedgerRpc for StubRpc {
        async fn submit(&self, _: &TransferPlan, _: Commitment) -> EngineResult<String> {
            unreachable!("clock never submits")
        }
        async fn signature_statuses(&self, _: &[String]) -> EngineResult<Vec<Option<SigStatus>>> {
            unreachable!()
        }
        async fn parsed_transaction(&self, _: &str) -> EngineResult<Option<RawParsedTx>> {
            unreachable!()
        }
        async fn lamport_balance(&self, _: &str) -> EngineResult<u64> {
            unreachable!()
        }
        async fn token_balance(&self, _: &str, _: &str) -> EngineResult<Decimal> {
            unreachable!()
        }
        async fn has_token_account(&self, _: &str, _: &str) -> EngineResult<bool> {
            unreachable!()
        }
        async fn confirmed_slot(&self) -> EngineResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::LedgerTransient("down".into()));
            }
            Ok(self.slot.load(Ordering::SeqCst))
        }
        async fn block_time_ms(&self, _: u64) -> EngineResult<Option<i64>> {
            Ok(Some(
                now_wall_ms() + self.block_offset_ms.load(Ordering::SeqCst),
            ))
        }
        async fn signatures_for_address(&self, _: &str, _: usize) -> EngineResult<Vec<String>> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn drift_follows_block_time() {
        let rpc = Arc::new(StubRpc::new(-2_500));
        let clock = ChainClock::new(rpc, 0, 1);
        clock.refresh().await;

        let snap = clock.snapshot();
        assert!(snap.drift_ms <= -2_400 && snap.drift_ms >= -2_600, "drift {}", snap.drift_ms);
        assert!((clock.now_ms() - (now_wall_ms() + snap.drift_ms)).abs() < 100);
    }

    #[tokio::test]
    async fn failed_sample_keeps_drift_and_throttles() {
        let rpc = Arc::new(StubRpc::new(-1_000));
        let clock = ChainClock::new(rpc.clone(), 0, 60_000);
        clock.refresh().await;
        let drift = clock.snapshot().drift_ms;

        rpc.fail.store(true, Ordering::SeqCst);
        clock.refresh().await; // throttled by min interval: no call
        assert_eq!(clock.snapshot().drift_ms, drift);
        // Degrades to local clock + last drift, never fails.
        let now = clock.now_ms();
        assert!((now - (now_wall_ms() + drift)).abs() < 100);
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce() {
        let rpc = Arc::new(StubRpc::new(0));
        let clock = Arc::new(ChainClock::new(rpc.clone(), 0, 5_000));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = clock.clone();
            handles.push(tokio::spawn(async move { c.refresh().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
    }
}
