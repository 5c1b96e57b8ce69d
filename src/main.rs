//! Token Derby - race lifecycle orchestrator daemon.
//!
//! Composition root: every service is constructed exactly once here and
//! passed down as a dependency; background loops are spawned at the end and
//! the process runs until ctrl-c.

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenderby_backend::{
    clock::ChainClock,
    events::EventBus,
    intake::WagerIntake,
    ledger::{HttpLedgerRpc, LedgerClient, LedgerRpc, PaperLedger},
    models::Config,
    oracle::{
        sim::{SimOracle, SimRunnerSource},
        PriceOracle, RunnerPicker, RunnerSource,
    },
    reconcile::Reconciler,
    scheduler::Scheduler,
    settlement::SettlementEngine,
    state_machine::StateMachine,
    store,
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenderby_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    info!(
        db = %config.database_path,
        ledger_mode = %config.ledger_mode,
        open_ms = config.open_ms,
        progress_ms = config.progress_ms,
        "🏁 Token Derby orchestrator starting"
    );

    let store = store::open_store(&config).context("failed to open store")?;

    // Ledger transport. Paper mode simulates the chain end to end; rpc mode
    // talks JSON-RPC (sends additionally need a deployment-provided signer).
    let rpc: Arc<dyn LedgerRpc> = match config.ledger_mode.as_str() {
        "rpc" => {
            warn!("rpc mode without a transaction signer: reads work, sends will be recorded as failures");
            Arc::new(HttpLedgerRpc::new(&config.rpc_url, None)?)
        }
        _ => {
            let paper = PaperLedger::new();
            // A funded escrow so payouts clear in simulation.
            paper.credit_lamports(
                &config.escrow_wallet,
                10_000 * tokenderby_backend::ledger::LAMPORTS_PER_SOL,
            );
            Arc::new(paper)
        }
    };
    let ledger = Arc::new(LedgerClient::new(rpc.clone()));

    let clock = Arc::new(ChainClock::new(
        rpc,
        config.onchain_time_refresh_ms,
        config.rpc_min_interval_ms,
    ));
    clock.refresh().await;
    tokio::spawn(clock.clone().run());

    let bus = EventBus::new();

    // Providers: simulated in paper mode; deployments substitute their own
    // implementations of the same traits.
    let oracle: Arc<dyn PriceOracle> = Arc::new(SimOracle::new());
    let runner_source: Arc<dyn RunnerSource> = Arc::new(SimRunnerSource);
    let picker = Arc::new(RunnerPicker::new(runner_source));

    // Apply the RACE mint from the environment on first boot.
    if let Ok(mint) = env::var("RACE_MINT") {
        let mut treasury = store.treasury().await?;
        if treasury.race_mint.as_deref() != Some(mint.as_str()) {
            treasury.race_mint = Some(mint);
            store.update_treasury(&treasury).await?;
        }
    }

    // Leaderboard projections may lag their results after a crash.
    if store.rebuild_stale_projections().await? {
        info!("leaderboard projections rebuilt from results");
    }

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
        picker.clone(),
        settlement.clone(),
        topup_tx,
    ));

    // The wager surface; HTTP/streaming layers sit on top of this handle.
    let _intake = WagerIntake::new(
        store.clone(),
        ledger.clone(),
        sm.clone(),
        config.clone(),
        bus.clone(),
    );

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        clock.clone(),
        config.clone(),
        sm.clone(),
        picker,
        oracle,
        bus.clone(),
    ));
    scheduler.start(topup_rx).await?;
    scheduler.ensure_topup().await?;

    Arc::new(Reconciler::new(store, ledger, config, settlement)).spawn_loops();

    // Event tap: every fan-out topic is visible in the logs.
    let mut sub = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = sub.next().await {
            tracing::debug!(topic = event.topic(), "event");
        }
    });

    info!("🏇 orchestrator running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
