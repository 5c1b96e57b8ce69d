//! Price oracle and runner source contracts, plus the selection logic the
//! scheduler and state machine share: vetting, the fallback pool of recently
//! seen runners, and baseline snapshots with bounded retry.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::models::Runner;

pub const MIN_RUNNERS: usize = 3;
pub const MAX_RUNNERS: usize = 8;
/// LOCK-time refresh wants a little slack over the race minimum.
pub const MIN_VETTED_FOR_REFRESH: usize = 4;
const FALLBACK_POOL_CAP: usize = 20;
const SNAPSHOT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPriority {
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub mint: String,
    pub price: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Candle {
    pub t: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TokenStats {
    pub current_price_usd: f64,
    pub price_change_h1_pct: f64,
    pub volume_usd_24h: f64,
    pub fdv_usd: f64,
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current prices for the given runners. `force` bypasses any provider
    /// cache; `priority` lets baseline capture jump provider queues.
    async fn snapshot(
        &self,
        runners: &[Runner],
        force: bool,
        priority: SnapshotPriority,
    ) -> EngineResult<Vec<PriceQuote>>;

    async fn ohlcv(
        &self,
        mint: &str,
        start_ms: i64,
        duration_minutes: u32,
        pool_address: Option<&str>,
    ) -> EngineResult<Vec<Candle>>;

    async fn token_stats(&self, mint: &str, pool: Option<&str>) -> EngineResult<TokenStats>;
}

#[async_trait]
pub trait RunnerSource: Send + Sync {
    /// Fresh token candidates; entries without a pool are unvetted and get
    /// filtered by the picker.
    async fn get_new_tokens(&self, limit: usize) -> EngineResult<Vec<Runner>>;
}

/// Runner selection with a memory of recently vetted tokens. When the source
/// is down, a race can still be built from a random draw over the last
/// `FALLBACK_POOL_CAP` vetted runners observed.
pub struct RunnerPicker {
    source: std::sync::Arc<dyn RunnerSource>,
    recent_vetted: Mutex<Vec<Runner>>,
}

impl RunnerPicker {
    pub fn new(source: std::sync::Arc<dyn RunnerSource>) -> Self {
        Self {
            source,
            recent_vetted: Mutex::new(Vec::new()),
        }
    }

    fn remember(&self, runners: &[Runner]) {
        let mut recent = self.recent_vetted.lock();
        for r in runners {
            if !r.is_vetted() {
                continue;
            }
            recent.retain(|known| known.mint != r.mint);
            recent.push(r.clone());
        }
        let overflow = recent.len().saturating_sub(FALLBACK_POOL_CAP);
        if overflow > 0 {
            recent.drain(0..overflow);
        }
    }

    pub fn fallback_pool_len(&self) -> usize {
        self.recent_vetted.lock().len()
    }

    /// Pick at least `min` vetted runners, at most `MAX_RUNNERS`.
    pub async fn pick(&self, min: usize) -> EngineResult<Vec<Runner>> {
        match self.source.get_new_tokens(MAX_RUNNERS * 2).await {
            Ok(candidates) => {
                let vetted: Vec<Runner> = candidates
                    .into_iter()
                    .filter(Runner::is_vetted)
                    .take(MAX_RUNNERS)
                    .collect();
                self.remember(&vetted);
                if vetted.len() >= min {
                    return Ok(vetted);
                }
                debug!(
                    vetted = vetted.len(),
                    min, "source returned too few vetted runners, trying fallback"
                );
            }
            Err(e) => warn!(error = %e, "runner source failed, trying fallback"),
        }

        // Random draw of MIN_RUNNERS from the recently vetted pool.
        let recent = self.recent_vetted.lock();
        if recent.len() >= MIN_RUNNERS {
            let mut rng = rand::thread_rng();
            let picked: Vec<Runner> = recent
                .choose_multiple(&mut rng, MIN_RUNNERS)
                .cloned()
                .collect();
            return Ok(picked);
        }

        Err(EngineError::OracleUnavailable(format!(
            "no runner source and only {} fallback runners",
            recent.len()
        )))
    }
}

/// Baseline snapshot with up to three attempts and a linearly increasing
/// backoff. Returns whatever quotes arrived; missing mints are the caller's
/// fallback problem.
pub async fn snapshot_with_retry(
    oracle: &dyn PriceOracle,
    runners: &[Runner],
) -> HashMap<String, f64> {
    for attempt in 1..=SNAPSHOT_ATTEMPTS {
        match oracle
            .snapshot(runners, true, SnapshotPriority::High)
            .await
        {
            Ok(quotes) => {
                return quotes.into_iter().map(|q| (q.mint, q.price)).collect();
            }
            Err(e) => {
                warn!(attempt, error = %e, "baseline snapshot attempt failed");
                if attempt < SNAPSHOT_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64 + 150)).await;
                }
            }
        }
    }
    HashMap::new()
}

/// Simulated providers for paper mode: a random-walk price oracle and a
/// synthetic runner source. Production deployments wire their own providers
/// against the same traits.
pub mod sim {
    use super::*;
    use rand::Rng;

    pub struct SimOracle {
        prices: Mutex<HashMap<String, f64>>,
    }

    impl Default for SimOracle {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SimOracle {
        pub fn new() -> Self {
            Self {
                prices: Mutex::new(HashMap::new()),
            }
        }

        fn step(&self, mint: &str) -> f64 {
            let mut prices = self.prices.lock();
            let price = prices.entry(mint.to_string()).or_insert_with(|| {
                rand::thread_rng().gen_range(0.000_1..0.01)
            });
            let drift = rand::thread_rng().gen_range(-0.03..0.03);
            *price *= 1.0 + drift;
            *price
        }
    }

    #[async_trait]
    impl PriceOracle for SimOracle {
        async fn snapshot(
            &self,
            runners: &[Runner],
            _force: bool,
            _priority: SnapshotPriority,
        ) -> EngineResult<Vec<PriceQuote>> {
            Ok(runners
                .iter()
                .map(|r| PriceQuote {
                    mint: r.mint.clone(),
                    price: self.step(&r.mint),
                })
                .collect())
        }

        async fn ohlcv(
            &self,
            mint: &str,
            start_ms: i64,
            duration_minutes: u32,
            _pool_address: Option<&str>,
        ) -> EngineResult<Vec<Candle>> {
            let mut candles = Vec::with_capacity(duration_minutes as usize);
            let mut price = self.step(mint);
            for i in 0..duration_minutes.max(1) {
                let open = price;
                price *= 1.0 + rand::thread_rng().gen_range(-0.02..0.02);
                candles.push(Candle {
                    t: start_ms + i as i64 * 60_000,
                    open,
                    high: open.max(price),
                    low: open.min(price),
                    close: price,
                    volume: rand::thread_rng().gen_range(100.0..10_000.0),
                });
            }
            Ok(candles)
        }

        async fn token_stats(
            &self,
            mint: &str,
            _pool: Option<&str>,
        ) -> EngineResult<TokenStats> {
            Ok(TokenStats {
                current_price_usd: self.step(mint),
                ..Default::default()
            })
        }
    }

    pub struct SimRunnerSource;

    #[async_trait]
    impl RunnerSource for SimRunnerSource {
        async fn get_new_tokens(&self, limit: usize) -> EngineResult<Vec<Runner>> {
            Ok((0..limit)
                .map(|_| {
                    let tag: u32 = rand::thread_rng().gen_range(1000..9999);
                    Runner {
                        mint: format!("simmint{tag}"),
                        symbol: format!("SIM{tag}"),
                        name: Some(format!("Sim Token {tag}")),
                        pool_address: format!("simpool{tag}"),
                        initial_price: 0.0,
                        initial_price_usd: 0.0,
                        initial_price_ts: None,
                        current_price: 0.0,
                        price_change: 0.0,
                        logo_uri: None,
                    }
                })
                .collect())
        }
    }
}
