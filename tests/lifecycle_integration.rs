//! End-to-end lifecycle tests: the state machine, settlement engine, payout
//! executor, and intake wired together over the simulated ledger and a
//! scripted oracle.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tokenderby_backend::{
    clock::ChainClock,
    errors::{EngineError, EngineResult},
    events::EventBus,
    intake::{WagerIntake, WagerRequest},
    ledger::{LedgerClient, PaperLedger, LAMPORTS_PER_SOL},
    models::{
        now_wall_ms, Config, Currency, Race, RacePhase, RaceStatus, Runner, TransferStatus,
        TransferType,
    },
    oracle::{
        Candle, PriceOracle, PriceQuote, RunnerPicker, RunnerSource, SnapshotPriority, TokenStats,
    },
    settlement::SettlementEngine,
    state_machine::StateMachine,
    store::{SqliteStore, Store},
};

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

struct ScriptedOracle {
    /// Per-mint (open, close) for the settlement window.
    window: Mutex<HashMap<String, (f64, f64)>>,
    fail_snapshot: AtomicBool,
    fail_ohlcv: AtomicBool,
}

impl ScriptedOracle {
    fn new() -> Self {
        Self {
            window: Mutex::new(HashMap::new()),
            fail_snapshot: AtomicBool::new(false),
            fail_ohlcv: AtomicBool::new(false),
        }
    }

    fn script(&self, mint: &str, open: f64, close: f64) {
        self.window.lock().insert(mint.to_string(), (open, close));
    }
}

#[async_trait]
impl PriceOracle for ScriptedOracle {
    async fn snapshot(
        &self,
        runners: &[Runner],
        _force: bool,
        _priority: SnapshotPriority,
    ) -> EngineResult<Vec<PriceQuote>> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(EngineError::OracleUnavailable("scripted outage".into()));
        }
        Ok(runners
            .iter()
            .map(|r| PriceQuote {
                mint: r.mint.clone(),
                price: 1.0,
            })
            .collect())
    }

    async fn ohlcv(
        &self,
        mint: &str,
        start_ms: i64,
        _duration_minutes: u32,
        _pool_address: Option<&str>,
    ) -> EngineResult<Vec<Candle>> {
        if self.fail_ohlcv.load(Ordering::SeqCst) {
            return Err(EngineError::OracleUnavailable("scripted outage".into()));
        }
        let (open, close) = self
            .window
            .lock()
            .get(mint)
            .copied()
            .unwrap_or((1.0, 1.0));
        Ok(vec![Candle {
            t: start_ms,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1_000.0,
        }])
    }

    async fn token_stats(&self, _mint: &str, _pool: Option<&str>) -> EngineResult<TokenStats> {
        Ok(TokenStats::default())
    }
}

struct StubRunnerSource;

#[async_trait]
impl RunnerSource for StubRunnerSource {
    async fn get_new_tokens(&self, limit: usize) -> EngineResult<Vec<Runner>> {
        Ok((0..limit.min(4))
            .map(|i| runner(&format!("fresh{i}")))
            .collect())
    }
}

fn runner(mint: &str) -> Runner {
    Runner {
        mint: mint.to_string(),
        symbol: mint.to_uppercase(),
        name: None,
        pool_address: format!("pool_{mint}"),
        initial_price: 0.0,
        initial_price_usd: 0.0,
        initial_price_ts: None,
        current_price: 0.0,
        price_change: 0.0,
        logo_uri: None,
    }
}

struct Harness {
    store: Arc<dyn Store>,
    paper: Arc<PaperLedger>,
    clock: Arc<ChainClock>,
    bus: EventBus,
    oracle: Arc<ScriptedOracle>,
    sm: Arc<StateMachine>,
    intake: WagerIntake,
    _topup_rx: mpsc::Receiver<()>,
    _tmp: tempfile::TempDir,
}

fn harness(tune: impl FnOnce(&mut Config)) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("test.db");

    let mut config = Config::from_env().unwrap();
    config.escrow_wallet = "escrow-wallet".into();
    config.treasury_wallet = "treasury-wallet".into();
    config.jackpot_wallet = "jackpot-wallet".into();
    // Quiet settlement: no house seeds unless a test wants them.
    config.house_seed_sol = Decimal::ZERO;
    config.house_seed_race = Decimal::ZERO;
    config.enable_race_bets = false;
    tune(&mut config);
    let config = Arc::new(config);

    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(db_path.to_str().unwrap()).unwrap());
    let paper = Arc::new(PaperLedger::new());
    paper.credit_lamports("escrow-wallet", 10_000 * LAMPORTS_PER_SOL);
    let ledger = Arc::new(LedgerClient::new(paper.clone()));

    let clock = Arc::new(ChainClock::new(paper.clone(), 0, 1));
    let bus = EventBus::new();
    let oracle = Arc::new(ScriptedOracle::new());
    let picker = Arc::new(RunnerPicker::new(Arc::new(StubRunnerSource)));

    let settlement = Arc::new(SettlementEngine::new(
        store.clone(),
        ledger.clone(),
        config.clone(),
        bus.clone(),
    ));
    let (topup_tx, topup_rx) = mpsc::channel(8);
    let sm = Arc::new(StateMachine::new(
        store.clone(),
        clock.clone(),
        bus.clone(),
        config.clone(),
        oracle.clone(),
        picker,
        settlement,
        topup_tx,
    ));
    let intake = WagerIntake::new(
        store.clone(),
        ledger,
        sm.clone(),
        config.clone(),
        bus.clone(),
    );

    Harness {
        store,
        paper,
        clock,
        bus,
        oracle,
        sm,
        intake,
        _topup_rx: topup_rx,
        _tmp: tmp,
    }
}

/// Prime the drift-corrected clock from the paper ledger's block time.
async fn refresh_clock(h: &Harness) {
    h.clock.refresh().await;
}

async fn create_open_race(h: &Harness, id: &str) -> Race {
    let race = Race {
        id: id.to_string(),
        start_ts: now_wall_ms(),
        rake_bps: 500,
        jackpot_flag: false,
        runners: vec![runner("m0"), runner("m1"), runner("m2")],
        phase: RacePhase::Open,
        created_at: now_wall_ms(),
    };
    h.store.create_race(&race).await.unwrap();
    race
}

/// Pay the escrow on-chain and place the wager through intake.
async fn place_sol_wager(
    h: &Harness,
    race_id: &str,
    wallet: &str,
    runner_idx: usize,
    amount: &str,
) -> EngineResult<tokenderby_backend::models::Wager> {
    let lamports = (dec(amount) * Decimal::from(LAMPORTS_PER_SOL))
        .trunc()
        .to_u64()
        .unwrap();
    let sig = h
        .paper
        .simulate_user_lamport_transfer(wallet, "escrow-wallet", lamports, None);
    h.intake
        .place(WagerRequest {
            race_id: race_id.to_string(),
            wallet: wallet.to_string(),
            runner_idx,
            amount: dec(amount),
            sig,
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await
}

async fn collect_topics(sub: &mut tokenderby_backend::events::Subscription) -> Vec<&'static str> {
    let mut topics = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), sub.next()).await {
        topics.push(event.topic());
    }
    topics
}

#[tokio::test]
async fn duplicate_wager_is_rejected_end_to_end() {
    let h = harness(|_| {});
    create_open_race(&h, "r1").await;
    h.paper.credit_lamports("alice", 10 * LAMPORTS_PER_SOL);

    let sig = h
        .paper
        .simulate_user_lamport_transfer("alice", "escrow-wallet", LAMPORTS_PER_SOL, None);

    let first = h
        .intake
        .place(WagerRequest {
            race_id: "r1".into(),
            wallet: "alice".into(),
            runner_idx: 0,
            amount: dec("1"),
            sig: sig.clone(),
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await;
    assert!(first.is_ok());

    let second = h
        .intake
        .place(WagerRequest {
            race_id: "r1".into(),
            wallet: "alice".into(),
            runner_idx: 0,
            amount: dec("1"),
            sig,
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await;
    assert!(matches!(second, Err(EngineError::DuplicateSignature(_))));

    assert_eq!(h.store.wagers_by_race("r1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn full_lifecycle_settles_two_winner_race() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    let mut sub = h.bus.subscribe();

    create_open_race(&h, "r1").await;
    for wallet in ["A", "B", "C"] {
        h.paper.credit_lamports(wallet, 10 * LAMPORTS_PER_SOL);
    }
    place_sol_wager(&h, "r1", "A", 0, "1").await.unwrap();
    place_sol_wager(&h, "r1", "B", 0, "3").await.unwrap();
    place_sol_wager(&h, "r1", "C", 1, "2").await.unwrap();

    // r0 gains 10%, r1 5%, r2 drops.
    h.oracle.script("m0", 1.0, 1.1);
    h.oracle.script("m1", 1.0, 1.05);
    h.oracle.script("m2", 1.0, 0.9);

    let race = h.sm.transition("r1", RaceStatus::Locked, "test").await.unwrap();
    assert_eq!(race.status(), RaceStatus::Locked);
    assert!(race.runners.iter().all(|r| r.initial_price > 0.0));

    let race = h
        .sm
        .transition("r1", RaceStatus::InProgress, "test")
        .await
        .unwrap();
    assert_eq!(race.status(), RaceStatus::InProgress);

    let race = h.sm.transition("r1", RaceStatus::Settled, "test").await.unwrap();
    assert_eq!(race.status(), RaceStatus::Settled);
    assert_eq!(race.winner_index(), Some(0));
    let evidence = race.phase.evidence().unwrap();
    assert_eq!(evidence.signature, "price_based_0_10.0000");
    assert!(!evidence.randomness.is_empty());

    // Parimutuel: pot 6, rake 0.3 (treasury 0.18, jackpot 0.12), pool 5.70.
    // A holds 1/4 of winning stake, B 3/4.
    assert_eq!(
        h.paper.lamports("A"),
        10 * LAMPORTS_PER_SOL - LAMPORTS_PER_SOL + 1_425_000_000
    );
    assert_eq!(
        h.paper.lamports("B"),
        10 * LAMPORTS_PER_SOL - 3 * LAMPORTS_PER_SOL + 4_275_000_000
    );
    assert_eq!(h.paper.lamports("C"), 8 * LAMPORTS_PER_SOL);
    assert_eq!(h.paper.lamports("treasury-wallet"), 180_000_000);

    let treasury = h.store.treasury().await.unwrap();
    assert_eq!(treasury.jackpot_balance_sol, dec("0.12"));

    // Bookkeeping: SUCCESS payout rows for both winners, one rake row.
    let transfers = h.store.transfers_by_race("r1").await.unwrap();
    let payouts: Vec<_> = transfers
        .iter()
        .filter(|t| t.transfer_type == TransferType::Payout)
        .collect();
    assert_eq!(payouts.len(), 2);
    assert!(payouts
        .iter()
        .all(|t| t.status == TransferStatus::Success && t.tx_sig.is_some()));
    assert_eq!(
        transfers
            .iter()
            .filter(|t| t.transfer_type == TransferType::Rake)
            .count(),
        1
    );

    // Stats: A profits 0.425, C lost 2.
    let stats = h.store.recalc_user_stats("A").await.unwrap();
    assert_eq!(stats.net, dec("0.425"));
    assert_eq!(stats.wins, 1);

    let topics = collect_topics(&mut sub).await;
    assert_eq!(
        topics.iter().filter(|t| **t == "race_settled").count(),
        1
    );
    assert!(topics.contains(&"race_locked"));
    assert!(topics.contains(&"race_live"));
    assert!(topics.contains(&"payout_executed"));
    assert!(topics.contains(&"user_loss"));

    // Recent winners picked it up.
    let winners = h.store.recent_winners(6).await.unwrap();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].mint, "m0");
}

#[tokio::test]
async fn no_winning_wagers_refunds_the_pot() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r1").await;
    for wallet in ["A", "B"] {
        h.paper.credit_lamports(wallet, 10 * LAMPORTS_PER_SOL);
    }
    place_sol_wager(&h, "r1", "A", 0, "1").await.unwrap();
    place_sol_wager(&h, "r1", "B", 0, "2").await.unwrap();

    // r1 wins but nobody backed it.
    h.oracle.script("m0", 1.0, 0.8);
    h.oracle.script("m1", 1.0, 1.5);
    h.oracle.script("m2", 1.0, 0.9);

    h.sm.transition("r1", RaceStatus::Locked, "test").await.unwrap();
    h.sm.transition("r1", RaceStatus::InProgress, "test").await.unwrap();
    let race = h.sm.transition("r1", RaceStatus::Settled, "test").await.unwrap();
    assert_eq!(race.winner_index(), Some(1));

    // Everyone got their stake back; the house took nothing.
    assert_eq!(h.paper.lamports("A"), 10 * LAMPORTS_PER_SOL);
    assert_eq!(h.paper.lamports("B"), 10 * LAMPORTS_PER_SOL);
    assert_eq!(h.paper.lamports("treasury-wallet"), 0);
    assert_eq!(
        h.store.treasury().await.unwrap().jackpot_balance_sol,
        Decimal::ZERO
    );

    let transfers = h.store.transfers_by_race("r1").await.unwrap();
    assert!(transfers
        .iter()
        .all(|t| t.transfer_type == TransferType::Payout && t.is_refund));
    assert_eq!(transfers.len(), 2);
    assert!(transfers.iter().all(|t| t.status == TransferStatus::Success));
}

#[tokio::test]
async fn concurrent_lock_attempts_produce_one_side_effect() {
    let h = harness(|c| {
        c.house_seed_sol = dec("0.01");
    });
    refresh_clock(&h).await;
    let mut sub = h.bus.subscribe();
    create_open_race(&h, "r1").await;

    let sm1 = h.sm.clone();
    let sm2 = h.sm.clone();
    let t1 = tokio::spawn(async move { sm1.transition("r1", RaceStatus::Locked, "a").await });
    let t2 = tokio::spawn(async move { sm2.transition("r1", RaceStatus::Locked, "b").await });
    let (r1, r2) = (t1.await.unwrap(), t2.await.unwrap());

    // Neither may fail with anything but a lock refusal, and the race ends
    // up LOCKED exactly once.
    for r in [&r1, &r2] {
        match r {
            Ok(_) => {}
            Err(EngineError::LockBlocked(_)) => {}
            Err(e) => panic!("unexpected transition error: {e}"),
        }
    }
    let race = h.store.race("r1").await.unwrap().unwrap();
    assert_eq!(race.status(), RaceStatus::Locked);

    let topics = collect_topics(&mut sub).await;
    assert_eq!(topics.iter().filter(|t| **t == "race_locked").count(), 1);

    // House seeds exist once per runner; stable synthetic signatures dedupe.
    let wagers = h.store.wagers_by_race("r1").await.unwrap();
    assert_eq!(wagers.len(), 3);
    assert!(wagers.iter().all(|w| w.wallet == "escrow-wallet"));
    assert!(wagers.iter().all(|w| w.sig.starts_with("seed_SOL_r1_")));
}

#[tokio::test]
async fn oracle_outage_settles_with_fallback_marker() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r1").await;
    h.paper.credit_lamports("A", 10 * LAMPORTS_PER_SOL);
    place_sol_wager(&h, "r1", "A", 0, "1").await.unwrap();

    h.sm.transition("r1", RaceStatus::Locked, "test").await.unwrap();
    h.sm.transition("r1", RaceStatus::InProgress, "test").await.unwrap();

    h.oracle.fail_ohlcv.store(true, Ordering::SeqCst);
    let race = h.sm.transition("r1", RaceStatus::Settled, "test").await.unwrap();

    let evidence = race.phase.evidence().unwrap();
    assert!(
        evidence.signature.ends_with("_fallback"),
        "signature: {}",
        evidence.signature
    );
    // All changes fall back to 0; ties resolve to the lowest index.
    assert_eq!(race.winner_index(), Some(0));
}

#[tokio::test]
async fn lock_with_failing_snapshot_still_advances() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r1").await;

    h.oracle.fail_snapshot.store(true, Ordering::SeqCst);
    let race = h.sm.transition("r1", RaceStatus::Locked, "test").await.unwrap();
    assert_eq!(race.status(), RaceStatus::Locked);
    // No quotes and no prior prices: baselines fall through to zero.
    assert!(race.runners.iter().all(|r| r.initial_price == 0.0));
}

#[tokio::test]
async fn maintenance_anchor_gates_the_lock_path() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r_anchor").await;
    create_open_race(&h, "r_other").await;

    let mut treasury = h.store.treasury().await.unwrap();
    treasury.maintenance_mode = true;
    treasury.maintenance_anchor_race_id = Some("r_anchor".into());
    h.store.update_treasury(&treasury).await.unwrap();

    let blocked = h.sm.transition("r_other", RaceStatus::Locked, "test").await;
    assert!(matches!(blocked, Err(EngineError::MaintenanceBlocked(_))));

    let race = h
        .sm
        .transition("r_anchor", RaceStatus::Locked, "test")
        .await
        .unwrap();
    assert_eq!(race.status(), RaceStatus::Locked);

    // Maintenance clears, the anchor leaves the active window, and the
    // other race resumes normal progression.
    let mut treasury = h.store.treasury().await.unwrap();
    treasury.maintenance_mode = false;
    treasury.maintenance_anchor_race_id = None;
    h.store.update_treasury(&treasury).await.unwrap();
    h.sm.transition("r_anchor", RaceStatus::Cancelled, "test")
        .await
        .unwrap();

    let race = h
        .sm
        .transition("r_other", RaceStatus::Locked, "test")
        .await
        .unwrap();
    assert_eq!(race.status(), RaceStatus::Locked);
}

#[tokio::test]
async fn single_active_invariant_blocks_second_lock() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r1").await;
    create_open_race(&h, "r2").await;

    h.sm.transition("r1", RaceStatus::Locked, "test").await.unwrap();
    let blocked = h.sm.transition("r2", RaceStatus::Locked, "test").await;
    assert!(matches!(blocked, Err(EngineError::LockBlocked(_))));

    // Statuses: exactly one race in the active window.
    let locked = h.store.races_by_status(RaceStatus::Locked).await.unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].id, "r1");
}

#[tokio::test]
async fn terminal_races_reject_further_transitions() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r1").await;
    h.sm.transition("r1", RaceStatus::Cancelled, "test").await.unwrap();

    for target in [RaceStatus::Locked, RaceStatus::Settled] {
        let result = h.sm.transition("r1", target, "test").await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }

    // Re-requesting the current status is a no-op, not an error.
    let race = h
        .sm
        .transition("r1", RaceStatus::Cancelled, "test")
        .await
        .unwrap();
    assert_eq!(race.status(), RaceStatus::Cancelled);
}

#[tokio::test]
async fn repeated_settle_is_idempotent() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r1").await;
    h.paper.credit_lamports("A", 10 * LAMPORTS_PER_SOL);
    place_sol_wager(&h, "r1", "A", 0, "1").await.unwrap();
    h.oracle.script("m0", 1.0, 1.2);

    h.sm.transition("r1", RaceStatus::Locked, "test").await.unwrap();
    h.sm.transition("r1", RaceStatus::InProgress, "test").await.unwrap();
    h.sm.transition("r1", RaceStatus::Settled, "test").await.unwrap();
    let balance_after_first = h.paper.lamports("A");

    let race = h.sm.transition("r1", RaceStatus::Settled, "test").await.unwrap();
    assert_eq!(race.status(), RaceStatus::Settled);
    assert_eq!(h.paper.lamports("A"), balance_after_first);
}

#[tokio::test]
async fn cancellation_refunds_all_wagers() {
    let h = harness(|_| {});
    refresh_clock(&h).await;
    create_open_race(&h, "r1").await;
    for wallet in ["A", "B"] {
        h.paper.credit_lamports(wallet, 10 * LAMPORTS_PER_SOL);
    }
    place_sol_wager(&h, "r1", "A", 0, "1.5").await.unwrap();
    place_sol_wager(&h, "r1", "B", 2, "0.5").await.unwrap();

    let race = h
        .sm
        .transition("r1", RaceStatus::Cancelled, "operator_request")
        .await
        .unwrap();
    assert_eq!(race.status(), RaceStatus::Cancelled);

    assert_eq!(h.paper.lamports("A"), 10 * LAMPORTS_PER_SOL);
    assert_eq!(h.paper.lamports("B"), 10 * LAMPORTS_PER_SOL);

    let transfers = h.store.transfers_by_race("r1").await.unwrap();
    assert_eq!(transfers.len(), 2);
    assert!(transfers.iter().all(|t| t.is_refund));
}

#[tokio::test]
async fn intake_enforces_envelope_and_maintenance() {
    let h = harness(|_| {});
    create_open_race(&h, "r1").await;
    h.paper.credit_lamports("alice", 10 * LAMPORTS_PER_SOL);

    // Below the minimum stake.
    let sig = h
        .paper
        .simulate_user_lamport_transfer("alice", "escrow-wallet", 1_000, None);
    let result = h
        .intake
        .place(WagerRequest {
            race_id: "r1".into(),
            wallet: "alice".into(),
            runner_idx: 0,
            amount: dec("0.000001"),
            sig,
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await;
    assert!(matches!(result, Err(EngineError::BudgetExceeded(_))));

    // A wager whose on-chain amount does not match is rejected and its
    // signature released for a corrected retry.
    let sig = h
        .paper
        .simulate_user_lamport_transfer("alice", "escrow-wallet", 42, None);
    let result = h
        .intake
        .place(WagerRequest {
            race_id: "r1".into(),
            wallet: "alice".into(),
            runner_idx: 0,
            amount: dec("1"),
            sig: sig.clone(),
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await;
    assert!(matches!(result, Err(EngineError::LedgerFatal(_))));
    assert!(!h.store.has_seen(&sig).await.unwrap());

    // With the maintenance switch on, intake refuses before touching anything.
    let h = harness(|c| c.block_new_bets = true);
    create_open_race(&h, "r1").await;
    h.paper.credit_lamports("alice", 10 * LAMPORTS_PER_SOL);
    let sig = h
        .paper
        .simulate_user_lamport_transfer("alice", "escrow-wallet", LAMPORTS_PER_SOL, None);
    let result = h
        .intake
        .place(WagerRequest {
            race_id: "r1".into(),
            wallet: "alice".into(),
            runner_idx: 0,
            amount: dec("1"),
            sig,
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await;
    assert!(matches!(result, Err(EngineError::MaintenanceBlocked(_))));
    assert!(h.store.wagers_by_race("r1").await.unwrap().is_empty());
}

#[tokio::test]
async fn wager_memo_attributes_referral_first_click_wins() {
    let h = harness(|_| {});
    create_open_race(&h, "r1").await;
    h.store
        .register_referral_code("carol", "CAROL1")
        .await
        .unwrap();
    h.store
        .register_referral_code("dave", "DAVE1")
        .await
        .unwrap();
    h.paper.credit_lamports("alice", 10 * LAMPORTS_PER_SOL);

    let sig = h.paper.simulate_user_lamport_transfer(
        "alice",
        "escrow-wallet",
        LAMPORTS_PER_SOL,
        Some("bet:r1:0:ref:CAROL1"),
    );
    h.intake
        .place(WagerRequest {
            race_id: "r1".into(),
            wallet: "alice".into(),
            runner_idx: 0,
            amount: dec("1"),
            sig,
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await
        .unwrap();

    // A later wager with a different code does not re-attribute.
    let sig = h.paper.simulate_user_lamport_transfer(
        "alice",
        "escrow-wallet",
        LAMPORTS_PER_SOL,
        Some("bet:r1:1:ref:DAVE1"),
    );
    h.intake
        .place(WagerRequest {
            race_id: "r1".into(),
            wallet: "alice".into(),
            runner_idx: 1,
            amount: dec("1"),
            sig,
            currency: Currency::Sol,
            client_id: None,
            memo: None,
        })
        .await
        .unwrap();

    let attribution = h.store.attribution_for("alice").await.unwrap().unwrap();
    assert_eq!(attribution.referrer_wallet, "carol");
    assert_eq!(attribution.code, "CAROL1");
}

#[tokio::test]
async fn jackpot_flagged_race_pays_and_drains_the_jackpot() {
    let h = harness(|_| {});
    refresh_clock(&h).await;

    // Seed the SOL jackpot.
    h.store
        .adjust_jackpot_balances(Decimal::ZERO, dec("0.5"))
        .await
        .unwrap();

    let mut race = create_open_race(&h, "r1").await;
    race.jackpot_flag = true;
    h.store.update_race(&race).await.unwrap();

    h.paper.credit_lamports("A", 10 * LAMPORTS_PER_SOL);
    h.paper.credit_lamports("B", 10 * LAMPORTS_PER_SOL);
    place_sol_wager(&h, "r1", "A", 0, "1").await.unwrap();
    place_sol_wager(&h, "r1", "B", 1, "1").await.unwrap();
    h.oracle.script("m0", 1.0, 1.2);
    h.oracle.script("m1", 1.0, 1.0);

    h.sm.transition("r1", RaceStatus::Locked, "test").await.unwrap();
    h.sm.transition("r1", RaceStatus::InProgress, "test").await.unwrap();
    h.sm.transition("r1", RaceStatus::Settled, "test").await.unwrap();

    // pot 2, rake 0.1, pool 1.9 + 0.5 jackpot = 2.4 entirely to A.
    assert_eq!(
        h.paper.lamports("A"),
        10 * LAMPORTS_PER_SOL - LAMPORTS_PER_SOL + 2_400_000_000
    );

    // Jackpot drained by the payout, then refilled by this race's
    // contribution (0.04).
    let treasury = h.store.treasury().await.unwrap();
    assert_eq!(treasury.jackpot_balance_sol, dec("0.04"));
}
