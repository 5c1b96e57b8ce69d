//! Shared domain types and environment-driven configuration.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{env, fmt, str::FromStr};

/// Race lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Open,
    Locked,
    InProgress,
    Settled,
    Cancelled,
}

impl RaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Open => "open",
            RaceStatus::Locked => "locked",
            RaceStatus::InProgress => "in_progress",
            RaceStatus::Settled => "settled",
            RaceStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RaceStatus::Settled | RaceStatus::Cancelled)
    }

    /// LOCKED or IN_PROGRESS: the single-active window of the global phase lock.
    pub fn is_active_phase(&self) -> bool {
        matches!(self, RaceStatus::Locked | RaceStatus::InProgress)
    }
}

impl fmt::Display for RaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RaceStatus::Open),
            "locked" => Ok(RaceStatus::Locked),
            "in_progress" => Ok(RaceStatus::InProgress),
            "settled" => Ok(RaceStatus::Settled),
            "cancelled" => Ok(RaceStatus::Cancelled),
            other => Err(format!("unknown race status: {other}")),
        }
    }
}

/// Wager / payout currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Sol,
    Race,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Sol => "SOL",
            Currency::Race => "RACE",
        }
    }

    pub const ALL: [Currency; 2] = [Currency::Sol, Currency::Race];
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SOL" | "sol" => Ok(Currency::Sol),
            "RACE" | "race" => Ok(Currency::Race),
            other => Err(format!("unknown currency: {other}")),
        }
    }
}

/// Sentinel recipients used in settlement bookkeeping rows.
pub mod sentinel {
    pub const ESCROW: &str = "escrow";
    pub const TREASURY: &str = "treasury";
    pub const JACKPOT: &str = "jackpot";
}

/// One token choice in a race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub mint: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub pool_address: String,
    #[serde(default)]
    pub initial_price: f64,
    #[serde(default)]
    pub initial_price_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_price_ts: Option<i64>,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub price_change: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,
}

impl Runner {
    /// A runner is vetted when it carries a tradable pool.
    pub fn is_vetted(&self) -> bool {
        !self.pool_address.trim().is_empty()
    }
}

/// Ledger coordinates captured when a race enters a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStamp {
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time_ms: Option<i64>,
}

impl PhaseStamp {
    pub fn at(ts: i64) -> Self {
        Self {
            ts,
            slot: None,
            block_time_ms: None,
        }
    }
}

/// Audit evidence recorded when a race settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drand_round: Option<u64>,
    /// JSON array of per-runner price changes.
    pub randomness: String,
    /// `price_based_<winnerIdx>_<gain 4dp>[_fallback]`
    pub signature: String,
}

/// Phase-tagged race state. Constructing a variant is the only way to reach
/// that phase, so a settled race always has a winner and complete stamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RacePhase {
    Open,
    Locked {
        locked: PhaseStamp,
    },
    InProgress {
        locked: PhaseStamp,
        in_progress: PhaseStamp,
    },
    Settled {
        locked: PhaseStamp,
        in_progress: PhaseStamp,
        settled: PhaseStamp,
        winner_index: usize,
        evidence: SettlementEvidence,
        /// Jackpot paid into the prize pool at settlement, per currency.
        jackpot_added_sol: Decimal,
        jackpot_added_race: Decimal,
    },
    Cancelled {
        locked: Option<PhaseStamp>,
        in_progress: Option<PhaseStamp>,
        cancelled_ts: i64,
        reason: String,
    },
}

impl RacePhase {
    pub fn status(&self) -> RaceStatus {
        match self {
            RacePhase::Open => RaceStatus::Open,
            RacePhase::Locked { .. } => RaceStatus::Locked,
            RacePhase::InProgress { .. } => RaceStatus::InProgress,
            RacePhase::Settled { .. } => RaceStatus::Settled,
            RacePhase::Cancelled { .. } => RaceStatus::Cancelled,
        }
    }

    pub fn locked_stamp(&self) -> Option<&PhaseStamp> {
        match self {
            RacePhase::Locked { locked } => Some(locked),
            RacePhase::InProgress { locked, .. } => Some(locked),
            RacePhase::Settled { locked, .. } => Some(locked),
            RacePhase::Cancelled { locked, .. } => locked.as_ref(),
            RacePhase::Open => None,
        }
    }

    pub fn in_progress_stamp(&self) -> Option<&PhaseStamp> {
        match self {
            RacePhase::InProgress { in_progress, .. } => Some(in_progress),
            RacePhase::Settled { in_progress, .. } => Some(in_progress),
            RacePhase::Cancelled { in_progress, .. } => in_progress.as_ref(),
            _ => None,
        }
    }

    pub fn settled_stamp(&self) -> Option<&PhaseStamp> {
        match self {
            RacePhase::Settled { settled, .. } => Some(settled),
            _ => None,
        }
    }

    pub fn winner_index(&self) -> Option<usize> {
        match self {
            RacePhase::Settled { winner_index, .. } => Some(*winner_index),
            _ => None,
        }
    }

    pub fn evidence(&self) -> Option<&SettlementEvidence> {
        match self {
            RacePhase::Settled { evidence, .. } => Some(evidence),
            _ => None,
        }
    }
}

/// A time-boxed market over a small set of tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Race {
    pub id: String,
    pub start_ts: i64,
    pub rake_bps: u16,
    pub jackpot_flag: bool,
    pub runners: Vec<Runner>,
    #[serde(flatten)]
    pub phase: RacePhase,
    pub created_at: i64,
}

impl Race {
    pub fn status(&self) -> RaceStatus {
        self.phase.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn winner_index(&self) -> Option<usize> {
        self.phase.winner_index()
    }

    pub fn winner(&self) -> Option<&Runner> {
        self.winner_index().and_then(|i| self.runners.get(i))
    }

    /// Millisecond timestamp the settlement window opened at.
    pub fn progress_start_ms(&self) -> i64 {
        self.phase
            .locked_stamp()
            .map(|s| s.block_time_ms.unwrap_or(s.ts))
            .unwrap_or(self.start_ts)
    }
}

/// A verified user wager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub id: String,
    pub race_id: String,
    pub wallet: String,
    pub runner_idx: usize,
    pub amount: Decimal,
    pub currency: Currency,
    /// On-chain transaction signature; globally unique.
    pub sig: String,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferType {
    Payout,
    Rake,
    Jackpot,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Payout => "PAYOUT",
            TransferType::Rake => "RAKE",
            TransferType::Jackpot => "JACKPOT",
        }
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAYOUT" => Ok(TransferType::Payout),
            "RAKE" => Ok(TransferType::Rake),
            "JACKPOT" => Ok(TransferType::Jackpot),
            other => Err(format!("unknown transfer type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferStatus {
    Pending,
    Success,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Success => "SUCCESS",
            TransferStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransferStatus::Pending),
            "SUCCESS" => Ok(TransferStatus::Success),
            "FAILED" => Ok(TransferStatus::Failed),
            other => Err(format!("unknown transfer status: {other}")),
        }
    }
}

/// Bookkeeping row for one settlement-driven on-chain transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementTransfer {
    pub id: String,
    pub race_id: String,
    pub transfer_type: TransferType,
    /// Recipient wallet or a `sentinel::*` marker.
    pub to_wallet: String,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_sig: Option<String>,
    pub currency: Currency,
    pub ts: i64,
    pub status: TransferStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Refund rows are PAYOUT transfers issued when a currency has no winners.
    #[serde(default)]
    pub is_refund: bool,
}

/// Observability row; never drives behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementError {
    pub id: String,
    pub race_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_wallet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    pub currency: Currency,
    pub error: String,
    pub ts: i64,
}

/// Single-row treasury state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Treasury {
    pub jackpot_balance_race: Decimal,
    pub jackpot_balance_sol: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub race_mint: Option<String>,
    pub maintenance_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_anchor_race_id: Option<String>,
}

impl Default for Treasury {
    fn default() -> Self {
        Self {
            jackpot_balance_race: Decimal::ZERO,
            jackpot_balance_sol: Decimal::ZERO,
            race_mint: None,
            maintenance_mode: false,
            maintenance_message: None,
            maintenance_anchor_race_id: None,
        }
    }
}

impl Treasury {
    pub fn jackpot_balance(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Sol => self.jackpot_balance_sol,
            Currency::Race => self.jackpot_balance_race,
        }
    }
}

/// Per-(wallet, race, currency) outcome projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRaceResult {
    pub id: String,
    pub wallet: String,
    pub race_id: String,
    pub currency: Currency,
    pub wagered: Decimal,
    pub payout: Decimal,
    pub won: bool,
    pub refund: bool,
    /// Leaderboard edge points; always zero for house wallets.
    pub edge_points: Decimal,
    pub ts: i64,
}

/// Aggregated per-wallet leaderboard stats; rebuildable from results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStats {
    pub wallet: String,
    pub races: u64,
    pub wins: u64,
    pub total_wagered: Decimal,
    pub total_payout: Decimal,
    pub net: Decimal,
    pub edge_points: Decimal,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentWinner {
    pub race_id: String,
    pub winner_index: usize,
    pub mint: String,
    pub symbol: String,
    pub price_change: f64,
    pub settled_ts: i64,
}

/// First-click referral attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralAttribution {
    pub wallet: String,
    pub code: String,
    pub referrer_wallet: String,
    pub attributed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RewardStatus {
    Queued,
    Paid,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardStatus::Queued => "QUEUED",
            RewardStatus::Paid => "PAID",
        }
    }
}

/// Queued referral obligation; delivery happens outside the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralReward {
    /// Deterministic: `ref_<raceId>_<from>_<to>_<level>`.
    pub id: String,
    pub race_id: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub level: u8,
    pub currency: Currency,
    pub amount: Decimal,
    pub status: RewardStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralSettings {
    pub enabled: bool,
    /// Basis points of a wallet's rake share paid to ancestors, levels 1..=3.
    pub level_bps: [u32; 3],
    /// Level-0 self-discount basis points.
    pub self_bps: u32,
    /// Rewards below this amount stay queued until they accumulate past it.
    pub min_payout: Decimal,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level_bps: [2000, 500, 250],
            self_bps: 500,
            min_payout: Decimal::new(1, 2), // 0.01
        }
    }
}

/// Events fanned out to live subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaceEvent {
    RaceCreated {
        race: Race,
    },
    RaceLocked {
        race: Race,
    },
    RaceLive {
        race: Race,
    },
    RaceSettled {
        race: Race,
    },
    RaceCancelled {
        race: Race,
    },
    RaceUpdated {
        race: Race,
    },
    BetPlaced {
        wager: Wager,
    },
    CountdownUpdate {
        race_id: String,
        status: RaceStatus,
        /// Absolute target of the next transition, drift-corrected.
        target_ts: i64,
        remaining_ms: i64,
    },
    PayoutExecuted {
        race_id: String,
        wallet: String,
        currency: Currency,
        amount: Decimal,
        tx_sig: String,
    },
    UserLoss {
        race_id: String,
        wallet: String,
        currency: Currency,
        amount: Decimal,
    },
}

impl RaceEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            RaceEvent::RaceCreated { .. } => "race_created",
            RaceEvent::RaceLocked { .. } => "race_locked",
            RaceEvent::RaceLive { .. } => "race_live",
            RaceEvent::RaceSettled { .. } => "race_settled",
            RaceEvent::RaceCancelled { .. } => "race_cancelled",
            RaceEvent::RaceUpdated { .. } => "race_updated",
            RaceEvent::BetPlaced { .. } => "bet_placed",
            RaceEvent::CountdownUpdate { .. } => "countdown_update",
            RaceEvent::PayoutExecuted { .. } => "payout_executed",
            RaceEvent::UserLoss { .. } => "user_loss",
        }
    }
}

/// Floor a currency amount to 9 decimal places (last-decimal dust stays in escrow).
pub fn floor_money(d: Decimal) -> Decimal {
    d.trunc_with_scale(9)
}

pub fn now_wall_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn env_or<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_decimal(var: &str, default: &str) -> Decimal {
    env::var(var)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).unwrap_or(Decimal::ZERO))
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub cache_only: bool,
    pub dual_store: bool,

    pub rpc_url: String,
    /// `paper` runs the in-process simulated ledger; `rpc` talks JSON-RPC.
    pub ledger_mode: String,

    pub escrow_wallet: String,
    pub treasury_wallet: String,
    pub jackpot_wallet: String,

    pub progress_ms: i64,
    pub open_ms: i64,
    pub locked_to_progress_ms: i64,
    pub transition_grace_ms: i64,

    pub onchain_time_refresh_ms: u64,
    pub rpc_min_interval_ms: u64,

    pub bet_min_sol: Decimal,
    pub bet_max_sol: Decimal,
    pub bet_min_race: Decimal,
    pub bet_max_race: Decimal,

    pub house_seed_sol: Decimal,
    pub house_seed_race: Decimal,

    pub jackpot_enabled: bool,
    pub jackpot_prob_pct: f64,
    pub jackpot_mirror_onchain: bool,

    pub block_new_races: bool,
    pub block_new_bets: bool,
    pub block_settlements: bool,
    pub enable_race_bets: bool,

    pub topup_target: usize,
    pub topup_interval_ms: u64,
    pub health_interval_ms: u64,
    pub max_retries: u32,

    pub tick_interval_ms: u64,
    pub countdown_interval_ms: u64,

    pub settlement_retry_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub seen_tx_ttl_ms: i64,
    pub referral_payout_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let progress_ms = env_or::<i64>("PROGRESS_WINDOW_MINUTES", 20) * 60_000;
        // OPEN must outlast PROGRESS by at least 30s so two races never contend
        // for the active window.
        let open_ms = (env_or::<i64>("OPEN_WINDOW_MINUTES", 0) * 60_000).max(progress_ms + 30_000);

        Ok(Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./tokenderby.db".to_string()),
            cache_only: env_flag("CACHE_ONLY", false),
            dual_store: env_flag("DUAL_STORE", false),

            rpc_url: env::var("SOLANA_RPC_URL")
                .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),
            ledger_mode: env::var("LEDGER_MODE").unwrap_or_else(|_| "paper".to_string()),

            escrow_wallet: env::var("ESCROW_WALLET")
                .unwrap_or_else(|_| "escrow-wallet".to_string()),
            treasury_wallet: env::var("TREASURY_WALLET")
                .unwrap_or_else(|_| "treasury-wallet".to_string()),
            jackpot_wallet: env::var("JACKPOT_WALLET")
                .unwrap_or_else(|_| "jackpot-wallet".to_string()),

            progress_ms,
            open_ms,
            locked_to_progress_ms: 2_000,
            transition_grace_ms: env_or("TRANSITION_GRACE_MS", 5_000),

            onchain_time_refresh_ms: env_or("ONCHAIN_TIME_REFRESH_MS", 30_000),
            rpc_min_interval_ms: env_or("SOLANA_RPC_MIN_INTERVAL_MS", 1_500),

            bet_min_sol: env_decimal("BET_MIN_SOL", "0.01"),
            bet_max_sol: env_decimal("BET_MAX_SOL", "10"),
            bet_min_race: env_decimal("BET_MIN_RACE", "100"),
            bet_max_race: env_decimal("BET_MAX_RACE", "1000000"),

            house_seed_sol: env_decimal("HOUSE_SEED_AMOUNT_SOL", "0.01"),
            house_seed_race: env_decimal("HOUSE_SEED_AMOUNT_RACE", "1000"),

            jackpot_enabled: env_flag("JACKPOT_ENABLED", true),
            jackpot_prob_pct: env_or("JACKPOT_PROB_PCT", 5.0),
            jackpot_mirror_onchain: env_flag("JACKPOT_MIRROR_ONCHAIN", false),

            block_new_races: env_flag("BLOCK_NEW_RACES", false),
            block_new_bets: env_flag("BLOCK_NEW_BETS", false),
            block_settlements: env_flag("BLOCK_SETTLEMENTS", false),
            enable_race_bets: env_flag("ENABLE_RACE_BETS", true),

            topup_target: env_or("OPEN_RACE_TARGET", 3),
            topup_interval_ms: env_or("TOPUP_INTERVAL_MS", 20_000),
            health_interval_ms: env_or("HEALTH_INTERVAL_MS", 30_000),
            max_retries: env_or("SCHEDULER_MAX_RETRIES", 3),

            tick_interval_ms: env_or("TICK_INTERVAL_MS", 10_000),
            countdown_interval_ms: env_or("COUNTDOWN_INTERVAL_MS", 1_000),

            settlement_retry_interval_ms: env_or("SETTLEMENT_RETRY_INTERVAL_MS", 60_000),
            reconcile_interval_ms: env_or("RECONCILE_INTERVAL_MS", 30_000),
            seen_tx_ttl_ms: env_or("SEEN_TX_TTL_MS", 48 * 3_600_000),
            referral_payout_interval_ms: env_or("REFERRAL_PAYOUT_INTERVAL_MS", 600_000),
        })
    }

    pub fn is_house_wallet(&self, wallet: &str) -> bool {
        wallet == self.escrow_wallet
            || wallet == self.treasury_wallet
            || wallet == self.jackpot_wallet
            || wallet == sentinel::ESCROW
            || wallet == sentinel::TREASURY
            || wallet == sentinel::JACKPOT
    }

    pub fn wager_envelope(&self, currency: Currency) -> (Decimal, Decimal) {
        match currency {
            Currency::Sol => (self.bet_min_sol, self.bet_max_sol),
            Currency::Race => (self.bet_min_race, self.bet_max_race),
        }
    }

    pub fn house_seed(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Sol => self.house_seed_sol,
            Currency::Race => self.house_seed_race,
        }
    }
}
