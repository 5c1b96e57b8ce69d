//! Durable SQLite store.
//!
//! WAL mode for concurrent reads during writes, prepared-statement caching on
//! the hot paths, `BEGIN IMMEDIATE` transactions where a read-modify-write
//! must be serialized (treasury adjustments). Currency amounts persist as
//! decimal strings; SQLite never does money arithmetic.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use async_trait::async_trait;

use crate::errors::{EngineError, EngineResult};
use crate::models::{
    now_wall_ms, Currency, PhaseStamp, Race, RacePhase, RaceStatus, RecentWinner,
    ReferralAttribution, ReferralReward, ReferralSettings, RewardStatus, Runner, SettlementError,
    SettlementEvidence, SettlementTransfer, TransferStatus, TransferType, Treasury,
    UserRaceResult, UserStats, Wager,
};

use super::{Store, TransferUpdate, WagerAggregate};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS races (
    id TEXT PRIMARY KEY,
    start_ts INTEGER NOT NULL,
    status TEXT NOT NULL,
    rake_bps INTEGER NOT NULL,
    jackpot_flag INTEGER NOT NULL,
    runners_json TEXT NOT NULL,
    locked_ts INTEGER,
    locked_slot INTEGER,
    locked_block_time_ms INTEGER,
    in_progress_ts INTEGER,
    in_progress_slot INTEGER,
    in_progress_block_time_ms INTEGER,
    settled_ts INTEGER,
    settled_slot INTEGER,
    settled_block_time_ms INTEGER,
    winner_index INTEGER,
    drand_round INTEGER,
    drand_randomness TEXT,
    drand_signature TEXT,
    jackpot_added_sol TEXT NOT NULL DEFAULT '0',
    jackpot_added_race TEXT NOT NULL DEFAULT '0',
    cancelled_ts INTEGER,
    cancelled_reason TEXT,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_races_status ON races(status, start_ts);

CREATE TABLE IF NOT EXISTS wagers (
    id TEXT PRIMARY KEY,
    race_id TEXT NOT NULL,
    wallet TEXT NOT NULL,
    runner_idx INTEGER NOT NULL,
    amount TEXT NOT NULL,
    currency TEXT NOT NULL,
    sig TEXT NOT NULL UNIQUE,
    ts INTEGER NOT NULL,
    block_time_ms INTEGER,
    slot INTEGER,
    client_id TEXT,
    memo TEXT
);

CREATE INDEX IF NOT EXISTS idx_wagers_race ON wagers(race_id, ts);
CREATE INDEX IF NOT EXISTS idx_wagers_wallet ON wagers(wallet, ts DESC);

CREATE TABLE IF NOT EXISTS treasury (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    jackpot_balance_race TEXT NOT NULL DEFAULT '0',
    jackpot_balance_sol TEXT NOT NULL DEFAULT '0',
    race_mint TEXT,
    maintenance_mode INTEGER NOT NULL DEFAULT 0,
    maintenance_message TEXT,
    maintenance_anchor_race_id TEXT
);

INSERT OR IGNORE INTO treasury (id) VALUES (1);

CREATE TABLE IF NOT EXISTS seen_tx (
    sig TEXT PRIMARY KEY,
    seen_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_seen_tx_seen_at ON seen_tx(seen_at);

CREATE TABLE IF NOT EXISTS settlement_transfers (
    id TEXT PRIMARY KEY,
    race_id TEXT NOT NULL,
    transfer_type TEXT NOT NULL,
    to_wallet TEXT NOT NULL,
    amount TEXT NOT NULL,
    tx_sig TEXT,
    currency TEXT NOT NULL,
    ts INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    batch_id TEXT,
    is_refund INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_transfers_race ON settlement_transfers(race_id, ts);
CREATE INDEX IF NOT EXISTS idx_transfers_wallet ON settlement_transfers(to_wallet, ts DESC);
CREATE INDEX IF NOT EXISTS idx_transfers_status ON settlement_transfers(status, ts);

CREATE TABLE IF NOT EXISTS settlement_errors (
    id TEXT PRIMARY KEY,
    race_id TEXT NOT NULL,
    to_wallet TEXT,
    amount TEXT,
    currency TEXT NOT NULL,
    error TEXT NOT NULL,
    ts INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_settlement_errors_race ON settlement_errors(race_id, ts DESC);
CREATE INDEX IF NOT EXISTS idx_settlement_errors_ts ON settlement_errors(ts DESC);

CREATE TABLE IF NOT EXISTS user_race_results (
    id TEXT PRIMARY KEY,
    wallet TEXT NOT NULL,
    race_id TEXT NOT NULL,
    currency TEXT NOT NULL,
    wagered TEXT NOT NULL,
    payout TEXT NOT NULL,
    won INTEGER NOT NULL,
    refund INTEGER NOT NULL,
    edge_points TEXT NOT NULL,
    ts INTEGER NOT NULL,
    UNIQUE(wallet, race_id, currency)
);

CREATE INDEX IF NOT EXISTS idx_results_wallet ON user_race_results(wallet, ts DESC);

CREATE TABLE IF NOT EXISTS user_stats (
    wallet TEXT PRIMARY KEY,
    races INTEGER NOT NULL,
    wins INTEGER NOT NULL,
    total_wagered TEXT NOT NULL,
    total_payout TEXT NOT NULL,
    net TEXT NOT NULL,
    edge_points TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS recent_winners (
    race_id TEXT PRIMARY KEY,
    winner_index INTEGER NOT NULL,
    mint TEXT NOT NULL,
    symbol TEXT NOT NULL,
    price_change REAL NOT NULL,
    settled_ts INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS referral_codes (
    code TEXT PRIMARY KEY,
    wallet TEXT NOT NULL UNIQUE
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS referral_attributions (
    wallet TEXT PRIMARY KEY,
    code TEXT NOT NULL,
    referrer_wallet TEXT NOT NULL,
    attributed_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS referral_rewards (
    id TEXT PRIMARY KEY,
    race_id TEXT NOT NULL,
    from_wallet TEXT NOT NULL,
    to_wallet TEXT NOT NULL,
    level INTEGER NOT NULL,
    currency TEXT NOT NULL,
    amount TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_referral_rewards_status ON referral_rewards(status, created_at);

CREATE TABLE IF NOT EXISTS referral_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    enabled INTEGER NOT NULL DEFAULT 1,
    l1_bps INTEGER NOT NULL DEFAULT 2000,
    l2_bps INTEGER NOT NULL DEFAULT 500,
    l3_bps INTEGER NOT NULL DEFAULT 250,
    self_bps INTEGER NOT NULL DEFAULT 500,
    min_payout TEXT NOT NULL DEFAULT '0.01'
);

INSERT OR IGNORE INTO referral_settings (id) VALUES (1);
"#;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

fn sql_err(e: rusqlite::Error) -> EngineError {
    EngineError::store(e)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open database at {db_path}"))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {journal_mode}");
        }

        let race_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM races", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, races = race_count, "durable store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch(SCHEMA_SQL).expect("schema");
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn race_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Race> {
        let status_s: String = row.get("status")?;
        let runners_json: String = row.get("runners_json")?;
        let runners: Vec<Runner> = serde_json::from_str(&runners_json).unwrap_or_default();

        let stamp = |prefix: &str| -> rusqlite::Result<Option<PhaseStamp>> {
            let ts: Option<i64> = row.get(format!("{prefix}_ts").as_str())?;
            Ok(ts.map(|ts| PhaseStamp {
                ts,
                slot: row
                    .get::<_, Option<i64>>(format!("{prefix}_slot").as_str())
                    .ok()
                    .flatten()
                    .map(|s| s as u64),
                block_time_ms: row
                    .get::<_, Option<i64>>(format!("{prefix}_block_time_ms").as_str())
                    .ok()
                    .flatten(),
            }))
        };

        let start_ts: i64 = row.get("start_ts")?;
        let locked = stamp("locked")?;
        let in_progress = stamp("in_progress")?;
        let settled = stamp("settled")?;

        let status = RaceStatus::from_str(&status_s).map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "status".into(), rusqlite::types::Type::Text)
        })?;

        // Stamps missing after a crash are synthesized so a persisted race
        // always reconstructs into a well-formed phase.
        let phase = match status {
            RaceStatus::Open => RacePhase::Open,
            RaceStatus::Locked => RacePhase::Locked {
                locked: locked.unwrap_or(PhaseStamp::at(start_ts)),
            },
            RaceStatus::InProgress => {
                let ip = in_progress.unwrap_or(PhaseStamp::at(start_ts));
                RacePhase::InProgress {
                    locked: locked.unwrap_or(PhaseStamp::at(ip.ts - 2_000)),
                    in_progress: ip,
                }
            }
            RaceStatus::Settled => {
                let settled = settled.unwrap_or(PhaseStamp::at(start_ts));
                let ip = in_progress.unwrap_or(settled);
                RacePhase::Settled {
                    locked: locked.unwrap_or(PhaseStamp::at(ip.ts - 2_000)),
                    in_progress: ip,
                    settled,
                    winner_index: row
                        .get::<_, Option<i64>>("winner_index")?
                        .unwrap_or(0)
                        .max(0) as usize,
                    evidence: SettlementEvidence {
                        drand_round: row
                            .get::<_, Option<i64>>("drand_round")?
                            .map(|r| r as u64),
                        randomness: row
                            .get::<_, Option<String>>("drand_randomness")?
                            .unwrap_or_default(),
                        signature: row
                            .get::<_, Option<String>>("drand_signature")?
                            .unwrap_or_default(),
                    },
                    jackpot_added_sol: dec(&row.get::<_, String>("jackpot_added_sol")?),
                    jackpot_added_race: dec(&row.get::<_, String>("jackpot_added_race")?),
                }
            }
            RaceStatus::Cancelled => RacePhase::Cancelled {
                locked,
                in_progress,
                cancelled_ts: row
                    .get::<_, Option<i64>>("cancelled_ts")?
                    .unwrap_or(start_ts),
                reason: row
                    .get::<_, Option<String>>("cancelled_reason")?
                    .unwrap_or_default(),
            },
        };

        Ok(Race {
            id: row.get("id")?,
            start_ts,
            rake_bps: row.get::<_, i64>("rake_bps")? as u16,
            jackpot_flag: row.get::<_, i64>("jackpot_flag")? != 0,
            runners,
            phase,
            created_at: row.get("created_at")?,
        })
    }

    fn persist_race(conn: &Connection, race: &Race, insert: bool) -> EngineResult<()> {
        let runners_json = serde_json::to_string(&race.runners)
            .map_err(|e| EngineError::store(format!("serialize runners: {e}")))?;

        let locked = race.phase.locked_stamp();
        let in_progress = race.phase.in_progress_stamp();
        let settled = race.phase.settled_stamp();

        let (winner_index, drand_round, randomness, signature, jp_sol, jp_race) = match &race.phase
        {
            RacePhase::Settled {
                winner_index,
                evidence,
                jackpot_added_sol,
                jackpot_added_race,
                ..
            } => (
                Some(*winner_index as i64),
                evidence.drand_round.map(|r| r as i64),
                Some(evidence.randomness.clone()),
                Some(evidence.signature.clone()),
                jackpot_added_sol.to_string(),
                jackpot_added_race.to_string(),
            ),
            _ => (None, None, None, None, "0".into(), "0".into()),
        };

        let (cancelled_ts, cancelled_reason) = match &race.phase {
            RacePhase::Cancelled {
                cancelled_ts,
                reason,
                ..
            } => (Some(*cancelled_ts), Some(reason.clone())),
            _ => (None, None),
        };

        let sql = if insert {
            "INSERT INTO races (
                id, start_ts, status, rake_bps, jackpot_flag, runners_json,
                locked_ts, locked_slot, locked_block_time_ms,
                in_progress_ts, in_progress_slot, in_progress_block_time_ms,
                settled_ts, settled_slot, settled_block_time_ms,
                winner_index, drand_round, drand_randomness, drand_signature,
                jackpot_added_sol, jackpot_added_race,
                cancelled_ts, cancelled_reason, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24)"
        } else {
            "UPDATE races SET
                start_ts=?2, status=?3, rake_bps=?4, jackpot_flag=?5, runners_json=?6,
                locked_ts=?7, locked_slot=?8, locked_block_time_ms=?9,
                in_progress_ts=?10, in_progress_slot=?11, in_progress_block_time_ms=?12,
                settled_ts=?13, settled_slot=?14, settled_block_time_ms=?15,
                winner_index=?16, drand_round=?17, drand_randomness=?18, drand_signature=?19,
                jackpot_added_sol=?20, jackpot_added_race=?21,
                cancelled_ts=?22, cancelled_reason=?23, created_at=?24
             WHERE id=?1"
        };

        let mut stmt = conn.prepare_cached(sql).map_err(sql_err)?;
        let changed = stmt
            .execute(params![
                race.id,
                race.start_ts,
                race.status().as_str(),
                race.rake_bps as i64,
                race.jackpot_flag as i64,
                runners_json,
                locked.map(|s| s.ts),
                locked.and_then(|s| s.slot).map(|s| s as i64),
                locked.and_then(|s| s.block_time_ms),
                in_progress.map(|s| s.ts),
                in_progress.and_then(|s| s.slot).map(|s| s as i64),
                in_progress.and_then(|s| s.block_time_ms),
                settled.map(|s| s.ts),
                settled.and_then(|s| s.slot).map(|s| s as i64),
                settled.and_then(|s| s.block_time_ms),
                winner_index,
                drand_round,
                randomness,
                signature,
                jp_sol,
                jp_race,
                cancelled_ts,
                cancelled_reason,
                race.created_at,
            ])
            .map_err(sql_err)?;

        if !insert && changed == 0 {
            return Err(EngineError::RaceNotFound(race.id.clone()));
        }
        Ok(())
    }

    fn wager_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Wager> {
        Ok(Wager {
            id: row.get("id")?,
            race_id: row.get("race_id")?,
            wallet: row.get("wallet")?,
            runner_idx: row.get::<_, i64>("runner_idx")? as usize,
            amount: dec(&row.get::<_, String>("amount")?),
            currency: Currency::from_str(&row.get::<_, String>("currency")?)
                .unwrap_or(Currency::Sol),
            sig: row.get("sig")?,
            ts: row.get("ts")?,
            block_time_ms: row.get("block_time_ms")?,
            slot: row.get::<_, Option<i64>>("slot")?.map(|s| s as u64),
            client_id: row.get("client_id")?,
            memo: row.get("memo")?,
        })
    }

    fn insert_wager(conn: &Connection, w: &Wager, or_ignore: bool) -> EngineResult<bool> {
        let sql = if or_ignore {
            "INSERT OR IGNORE INTO wagers
                (id, race_id, wallet, runner_idx, amount, currency, sig, ts,
                 block_time_ms, slot, client_id, memo)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
        } else {
            "INSERT INTO wagers
                (id, race_id, wallet, runner_idx, amount, currency, sig, ts,
                 block_time_ms, slot, client_id, memo)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
        };
        let mut stmt = conn.prepare_cached(sql).map_err(sql_err)?;
        let result = stmt.execute(params![
            w.id,
            w.race_id,
            w.wallet,
            w.runner_idx as i64,
            w.amount.to_string(),
            w.currency.as_str(),
            w.sig,
            w.ts,
            w.block_time_ms,
            w.slot.map(|s| s as i64),
            w.client_id,
            w.memo,
        ]);

        match result {
            Ok(changed) => Ok(changed > 0),
            Err(e) if is_unique_violation(&e) => {
                Err(EngineError::DuplicateSignature(w.sig.clone()))
            }
            Err(e) => Err(sql_err(e)),
        }
    }

    fn transfer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SettlementTransfer> {
        Ok(SettlementTransfer {
            id: row.get("id")?,
            race_id: row.get("race_id")?,
            transfer_type: TransferType::from_str(&row.get::<_, String>("transfer_type")?)
                .unwrap_or(TransferType::Payout),
            to_wallet: row.get("to_wallet")?,
            amount: dec(&row.get::<_, String>("amount")?),
            tx_sig: row.get("tx_sig")?,
            currency: Currency::from_str(&row.get::<_, String>("currency")?)
                .unwrap_or(Currency::Sol),
            ts: row.get("ts")?,
            status: TransferStatus::from_str(&row.get::<_, String>("status")?)
                .unwrap_or(TransferStatus::Pending),
            attempts: row.get::<_, i64>("attempts")? as u32,
            last_error: row.get("last_error")?,
            batch_id: row.get("batch_id")?,
            is_refund: row.get::<_, i64>("is_refund")? != 0,
        })
    }

    fn stats_from_results(wallet: &str, results: &[UserRaceResult]) -> UserStats {
        let mut stats = UserStats {
            wallet: wallet.to_string(),
            races: 0,
            wins: 0,
            total_wagered: Decimal::ZERO,
            total_payout: Decimal::ZERO,
            net: Decimal::ZERO,
            edge_points: Decimal::ZERO,
            updated_at: now_wall_ms(),
        };
        for r in results {
            stats.races += 1;
            if r.won {
                stats.wins += 1;
            }
            stats.total_wagered += r.wagered;
            stats.total_payout += r.payout;
            stats.edge_points += r.edge_points;
        }
        stats.net = stats.total_payout - stats.total_wagered;
        stats
    }

    fn results_for_wallet(conn: &Connection, wallet: &str) -> EngineResult<Vec<UserRaceResult>> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, wallet, race_id, currency, wagered, payout, won, refund,
                        edge_points, ts
                 FROM user_race_results WHERE wallet = ?1 ORDER BY ts",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![wallet], Self::result_from_row)
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn result_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRaceResult> {
        Ok(UserRaceResult {
            id: row.get("id")?,
            wallet: row.get("wallet")?,
            race_id: row.get("race_id")?,
            currency: Currency::from_str(&row.get::<_, String>("currency")?)
                .unwrap_or(Currency::Sol),
            wagered: dec(&row.get::<_, String>("wagered")?),
            payout: dec(&row.get::<_, String>("payout")?),
            won: row.get::<_, i64>("won")? != 0,
            refund: row.get::<_, i64>("refund")? != 0,
            edge_points: dec(&row.get::<_, String>("edge_points")?),
            ts: row.get("ts")?,
        })
    }

    fn write_stats(conn: &Connection, stats: &UserStats) -> EngineResult<()> {
        conn.prepare_cached(
            "INSERT INTO user_stats
                (wallet, races, wins, total_wagered, total_payout, net, edge_points, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(wallet) DO UPDATE SET
                races=?2, wins=?3, total_wagered=?4, total_payout=?5,
                net=?6, edge_points=?7, updated_at=?8",
        )
        .map_err(sql_err)?
        .execute(params![
            stats.wallet,
            stats.races as i64,
            stats.wins as i64,
            stats.total_wagered.to_string(),
            stats.total_payout.to_string(),
            stats.net.to_string(),
            stats.edge_points.to_string(),
            stats.updated_at,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    fn stats_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserStats> {
        Ok(UserStats {
            wallet: row.get("wallet")?,
            races: row.get::<_, i64>("races")? as u64,
            wins: row.get::<_, i64>("wins")? as u64,
            total_wagered: dec(&row.get::<_, String>("total_wagered")?),
            total_payout: dec(&row.get::<_, String>("total_payout")?),
            net: dec(&row.get::<_, String>("net")?),
            edge_points: dec(&row.get::<_, String>("edge_points")?),
            updated_at: row.get("updated_at")?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_race(&self, race: &Race) -> EngineResult<()> {
        let conn = self.conn.lock();
        Self::persist_race(&conn, race, true)
    }

    async fn race(&self, id: &str) -> EngineResult<Option<Race>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM races WHERE id = ?1")
            .map_err(sql_err)?;
        match stmt.query_row(params![id], Self::race_from_row) {
            Ok(race) => Ok(Some(race)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        }
    }

    async fn races_by_status(&self, status: RaceStatus) -> EngineResult<Vec<Race>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM races WHERE status = ?1 ORDER BY start_ts")
            .map_err(sql_err)?;
        let races = stmt
            .query_map(params![status.as_str()], Self::race_from_row)
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(races)
    }

    async fn all_races(&self) -> EngineResult<Vec<Race>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM races ORDER BY start_ts")
            .map_err(sql_err)?;
        let races = stmt
            .query_map([], Self::race_from_row)
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(races)
    }

    async fn update_race(&self, race: &Race) -> EngineResult<()> {
        let conn = self.conn.lock();
        Self::persist_race(&conn, race, false)
    }

    async fn create_wager(&self, wager: &Wager) -> EngineResult<()> {
        let conn = self.conn.lock();
        Self::insert_wager(&conn, wager, false).map(|_| ())
    }

    async fn hydrate_wager(&self, wager: &Wager) -> EngineResult<bool> {
        let conn = self.conn.lock();
        Self::insert_wager(&conn, wager, true)
    }

    async fn wagers_by_race(&self, race_id: &str) -> EngineResult<Vec<Wager>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM wagers WHERE race_id = ?1 ORDER BY ts, rowid")
            .map_err(sql_err)?;
        let wagers = stmt
            .query_map(params![race_id], Self::wager_from_row)
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(wagers)
    }

    async fn wagers_by_wallet(
        &self,
        wallet: &str,
        race_id: Option<&str>,
    ) -> EngineResult<Vec<Wager>> {
        let conn = self.conn.lock();
        match race_id {
            Some(rid) => {
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT * FROM wagers WHERE wallet = ?1 AND race_id = ?2
                         ORDER BY ts, rowid",
                    )
                    .map_err(sql_err)?;
                let result = Ok(stmt
                    .query_map(params![wallet, rid], Self::wager_from_row)
                    .map_err(sql_err)?
                    .filter_map(|r| r.ok())
                    .collect());
                result
            }
            None => {
                let mut stmt = conn
                    .prepare_cached("SELECT * FROM wagers WHERE wallet = ?1 ORDER BY ts, rowid")
                    .map_err(sql_err)?;
                let result = Ok(stmt
                    .query_map(params![wallet], Self::wager_from_row)
                    .map_err(sql_err)?
                    .filter_map(|r| r.ok())
                    .collect());
                result
            }
        }
    }

    async fn wager_aggregates_by_race(&self, race_id: &str) -> EngineResult<Vec<WagerAggregate>> {
        // Amounts are decimal strings, so aggregation happens here rather
        // than in SQL.
        let wagers = self.wagers_by_race(race_id).await?;
        let mut agg: BTreeMap<(Currency, usize), (Decimal, u64)> = BTreeMap::new();
        for w in &wagers {
            let e = agg
                .entry((w.currency, w.runner_idx))
                .or_insert((Decimal::ZERO, 0));
            e.0 += w.amount;
            e.1 += 1;
        }
        Ok(agg
            .into_iter()
            .map(|((currency, runner_idx), (total, count))| WagerAggregate {
                race_id: race_id.to_string(),
                currency,
                runner_idx,
                total,
                wager_count: count,
            })
            .collect())
    }

    async fn treasury(&self) -> EngineResult<Treasury> {
        let conn = self.conn.lock();
        let mut t = conn
            .prepare_cached("SELECT * FROM treasury WHERE id = 1")
            .map_err(sql_err)?
            .query_row([], |row| {
                Ok(Treasury {
                    jackpot_balance_race: dec(&row.get::<_, String>("jackpot_balance_race")?),
                    jackpot_balance_sol: dec(&row.get::<_, String>("jackpot_balance_sol")?),
                    race_mint: row.get("race_mint")?,
                    maintenance_mode: row.get::<_, i64>("maintenance_mode")? != 0,
                    maintenance_message: row.get("maintenance_message")?,
                    maintenance_anchor_race_id: row.get("maintenance_anchor_race_id")?,
                })
            })
            .map_err(sql_err)?;

        // Heal persisted negatives on read.
        if t.jackpot_balance_race < Decimal::ZERO || t.jackpot_balance_sol < Decimal::ZERO {
            warn!("healing negative jackpot balance");
            t.jackpot_balance_race = t.jackpot_balance_race.max(Decimal::ZERO);
            t.jackpot_balance_sol = t.jackpot_balance_sol.max(Decimal::ZERO);
            conn.execute(
                "UPDATE treasury SET jackpot_balance_race = ?1, jackpot_balance_sol = ?2
                 WHERE id = 1",
                params![
                    t.jackpot_balance_race.to_string(),
                    t.jackpot_balance_sol.to_string()
                ],
            )
            .map_err(sql_err)?;
        }
        Ok(t)
    }

    async fn update_treasury(&self, treasury: &Treasury) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE treasury SET
                jackpot_balance_race = ?1, jackpot_balance_sol = ?2, race_mint = ?3,
                maintenance_mode = ?4, maintenance_message = ?5,
                maintenance_anchor_race_id = ?6
             WHERE id = 1",
        )
        .map_err(sql_err)?
        .execute(params![
            treasury.jackpot_balance_race.max(Decimal::ZERO).to_string(),
            treasury.jackpot_balance_sol.max(Decimal::ZERO).to_string(),
            treasury.race_mint,
            treasury.maintenance_mode as i64,
            treasury.maintenance_message,
            treasury.maintenance_anchor_race_id,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    async fn adjust_jackpot_balances(
        &self,
        delta_race: Decimal,
        delta_sol: Decimal,
    ) -> EngineResult<(Decimal, Decimal)> {
        let conn = self.conn.lock();
        // BEGIN IMMEDIATE takes the write lock up front: the SQLite analog of
        // SELECT ... FOR UPDATE on the treasury row.
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_err)?;

        let result = (|| -> EngineResult<(Decimal, Decimal)> {
            let (race_s, sol_s): (String, String) = conn
                .query_row(
                    "SELECT jackpot_balance_race, jackpot_balance_sol FROM treasury WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(sql_err)?;

            let new_race = (dec(&race_s) + delta_race).max(Decimal::ZERO);
            let new_sol = (dec(&sol_s) + delta_sol).max(Decimal::ZERO);

            conn.execute(
                "UPDATE treasury SET jackpot_balance_race = ?1, jackpot_balance_sol = ?2
                 WHERE id = 1",
                params![new_race.to_string(), new_sol.to_string()],
            )
            .map_err(sql_err)?;

            Ok((new_race, new_sol))
        })();

        match &result {
            Ok(_) => conn.execute_batch("COMMIT").map_err(sql_err)?,
            Err(_) => {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
        result
    }

    async fn has_seen(&self, sig: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM seen_tx WHERE sig = ?1")
            .map_err(sql_err)?
            .query_row(params![sig], |row| row.get(0))
            .map_err(sql_err)?;
        Ok(count > 0)
    }

    async fn record_seen(&self, sig: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("INSERT OR IGNORE INTO seen_tx (sig, seen_at) VALUES (?1, ?2)")
            .map_err(sql_err)?
            .execute(params![sig, now_wall_ms()])
            .map_err(sql_err)?;
        Ok(())
    }

    async fn reserve(&self, sig: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .prepare_cached("INSERT OR IGNORE INTO seen_tx (sig, seen_at) VALUES (?1, ?2)")
            .map_err(sql_err)?
            .execute(params![sig, now_wall_ms()])
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    async fn release(&self, sig: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("DELETE FROM seen_tx WHERE sig = ?1")
            .map_err(sql_err)?
            .execute(params![sig])
            .map_err(sql_err)?;
        Ok(())
    }

    async fn cleanup_seen(&self, older_than_ms: i64) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let removed = conn
            .prepare_cached("DELETE FROM seen_tx WHERE seen_at < ?1")
            .map_err(sql_err)?
            .execute(params![older_than_ms])
            .map_err(sql_err)?;
        Ok(removed as u64)
    }

    async fn record_transfer(&self, t: &SettlementTransfer) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO settlement_transfers
                (id, race_id, transfer_type, to_wallet, amount, tx_sig, currency,
                 ts, status, attempts, last_error, batch_id, is_refund)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
                tx_sig=?6, status=?9, attempts=?10, last_error=?11, batch_id=?12",
        )
        .map_err(sql_err)?
        .execute(params![
            t.id,
            t.race_id,
            t.transfer_type.as_str(),
            t.to_wallet,
            t.amount.to_string(),
            t.tx_sig,
            t.currency.as_str(),
            t.ts,
            t.status.as_str(),
            t.attempts as i64,
            t.last_error,
            t.batch_id,
            t.is_refund as i64,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    async fn transfers_by_race(&self, race_id: &str) -> EngineResult<Vec<SettlementTransfer>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM settlement_transfers WHERE race_id = ?1 ORDER BY ts")
            .map_err(sql_err)?;
        let result = Ok(stmt
            .query_map(params![race_id], Self::transfer_from_row)
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect());
        result
    }

    async fn transfers_by_wallet(
        &self,
        wallet: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM settlement_transfers WHERE to_wallet = ?1
                 ORDER BY ts DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let result = Ok(stmt
            .query_map(params![wallet, limit as i64], Self::transfer_from_row)
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect());
        result
    }

    async fn transfer_for_race_and_wallet(
        &self,
        race_id: &str,
        wallet: &str,
        currency: Currency,
    ) -> EngineResult<Option<SettlementTransfer>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM settlement_transfers
                 WHERE race_id = ?1 AND to_wallet = ?2 AND currency = ?3
                   AND transfer_type = 'PAYOUT'
                 ORDER BY ts LIMIT 1",
            )
            .map_err(sql_err)?;
        match stmt.query_row(
            params![race_id, wallet, currency.as_str()],
            Self::transfer_from_row,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        }
    }

    async fn update_transfer_status(
        &self,
        id: &str,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE settlement_transfers SET
                status = ?2,
                tx_sig = COALESCE(?3, tx_sig),
                last_error = COALESCE(?4, last_error),
                attempts = attempts + ?5
             WHERE id = ?1",
        )
        .map_err(sql_err)?
        .execute(params![
            id,
            status.as_str(),
            update.tx_sig,
            update.error,
            update.inc_attempts as i64,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    async fn failed_or_pending_transfers(
        &self,
        limit: usize,
    ) -> EngineResult<Vec<SettlementTransfer>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM settlement_transfers
                 WHERE status IN ('PENDING','FAILED')
                 ORDER BY ts LIMIT ?1",
            )
            .map_err(sql_err)?;
        let result = Ok(stmt
            .query_map(params![limit as i64], Self::transfer_from_row)
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect());
        result
    }

    async fn record_settlement_error(&self, e: &SettlementError) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT OR REPLACE INTO settlement_errors
                (id, race_id, to_wallet, amount, currency, error, ts)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
        )
        .map_err(sql_err)?
        .execute(params![
            e.id,
            e.race_id,
            e.to_wallet,
            e.amount.map(|a| a.to_string()),
            e.currency.as_str(),
            e.error,
            e.ts,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    async fn settlement_errors_by_race(
        &self,
        race_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<SettlementError>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM settlement_errors WHERE race_id = ?1
                 ORDER BY ts DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let result = Ok(stmt
            .query_map(params![race_id, limit as i64], |row| {
                Ok(SettlementError {
                    id: row.get("id")?,
                    race_id: row.get("race_id")?,
                    to_wallet: row.get("to_wallet")?,
                    amount: row
                        .get::<_, Option<String>>("amount")?
                        .map(|s| dec(&s)),
                    currency: Currency::from_str(&row.get::<_, String>("currency")?)
                        .unwrap_or(Currency::Sol),
                    error: row.get("error")?,
                    ts: row.get("ts")?,
                })
            })
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect());
        result
    }

    async fn recent_settlement_errors(&self, limit: usize) -> EngineResult<Vec<SettlementError>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM settlement_errors ORDER BY ts DESC LIMIT ?1")
            .map_err(sql_err)?;
        let result = Ok(stmt
            .query_map(params![limit as i64], |row| {
                Ok(SettlementError {
                    id: row.get("id")?,
                    race_id: row.get("race_id")?,
                    to_wallet: row.get("to_wallet")?,
                    amount: row
                        .get::<_, Option<String>>("amount")?
                        .map(|s| dec(&s)),
                    currency: Currency::from_str(&row.get::<_, String>("currency")?)
                        .unwrap_or(Currency::Sol),
                    error: row.get("error")?,
                    ts: row.get("ts")?,
                })
            })
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect());
        result
    }

    async fn upsert_user_race_result(&self, r: &UserRaceResult) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO user_race_results
                (id, wallet, race_id, currency, wagered, payout, won, refund, edge_points, ts)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
             ON CONFLICT(wallet, race_id, currency) DO UPDATE SET
                wagered=?5, payout=?6, won=?7, refund=?8, edge_points=?9, ts=?10",
        )
        .map_err(sql_err)?
        .execute(params![
            r.id,
            r.wallet,
            r.race_id,
            r.currency.as_str(),
            r.wagered.to_string(),
            r.payout.to_string(),
            r.won as i64,
            r.refund as i64,
            r.edge_points.to_string(),
            r.ts,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    async fn recalc_user_stats(&self, wallet: &str) -> EngineResult<UserStats> {
        let conn = self.conn.lock();
        let results = Self::results_for_wallet(&conn, wallet)?;
        let stats = Self::stats_from_results(wallet, &results);
        Self::write_stats(&conn, &stats)?;
        Ok(stats)
    }

    async fn leaderboard(&self, limit: usize) -> EngineResult<Vec<UserStats>> {
        let (rows, have_results) = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM user_stats
                     ORDER BY CAST(edge_points AS REAL) DESC, wallet LIMIT ?1",
                )
                .map_err(sql_err)?;
            let rows: Vec<UserStats> = stmt
                .query_map(params![limit as i64], Self::stats_from_row)
                .map_err(sql_err)?
                .filter_map(|r| r.ok())
                .collect();
            let have_results: i64 = conn
                .query_row("SELECT COUNT(*) FROM user_race_results", [], |row| {
                    row.get(0)
                })
                .unwrap_or(0);
            (rows, have_results > 0)
        };

        // Fall back to the raw results when the projection is empty.
        if rows.is_empty() && have_results {
            self.rebuild_stale_projections().await?;
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT * FROM user_stats
                     ORDER BY CAST(edge_points AS REAL) DESC, wallet LIMIT ?1",
                )
                .map_err(sql_err)?;
            let result = Ok(stmt
                .query_map(params![limit as i64], Self::stats_from_row)
                .map_err(sql_err)?
                .filter_map(|r| r.ok())
                .collect());
            return result;
        }
        Ok(rows)
    }

    async fn user_rank(&self, wallet: &str) -> EngineResult<Option<u64>> {
        let points = {
            let conn = self.conn.lock();
            let result = conn
                .prepare_cached("SELECT edge_points FROM user_stats WHERE wallet = ?1")
                .map_err(sql_err)?
                .query_row(params![wallet], |row| row.get::<_, String>(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    e => Err(e),
                })
                .map_err(sql_err)?;
            result
        };

        let points = match points {
            Some(p) => p,
            None => {
                // Fall back to the raw results before declaring the wallet
                // unranked.
                let has_results: i64 = {
                    let conn = self.conn.lock();
                    let result = conn
                        .prepare_cached(
                            "SELECT COUNT(*) FROM user_race_results WHERE wallet = ?1",
                        )
                        .map_err(sql_err)?
                        .query_row(params![wallet], |row| row.get(0))
                        .map_err(sql_err)?;
                    result
                };
                if has_results == 0 {
                    return Ok(None);
                }
                self.recalc_user_stats(wallet).await?.edge_points.to_string()
            }
        };

        let conn = self.conn.lock();
        let ahead: i64 = conn
            .prepare_cached(
                "SELECT COUNT(*) FROM user_stats
                 WHERE CAST(edge_points AS REAL) > CAST(?1 AS REAL)",
            )
            .map_err(sql_err)?
            .query_row(params![points], |row| row.get(0))
            .map_err(sql_err)?;
        Ok(Some(ahead as u64 + 1))
    }

    async fn rebuild_stale_projections(&self) -> EngineResult<bool> {
        let wallets: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT r.wallet FROM
                        (SELECT wallet, COUNT(*) AS n FROM user_race_results GROUP BY wallet) r
                     LEFT JOIN user_stats s ON s.wallet = r.wallet
                     WHERE s.wallet IS NULL OR s.races < r.n",
                )
                .map_err(sql_err)?;
            let result = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(sql_err)?
                .filter_map(|r| r.ok())
                .collect();
            result
        };

        if wallets.is_empty() {
            return Ok(false);
        }
        info!(count = wallets.len(), "rebuilding stale leaderboard projections");
        for wallet in &wallets {
            self.recalc_user_stats(wallet).await?;
        }
        Ok(true)
    }

    async fn add_recent_winner(&self, race: &Race) -> EngineResult<()> {
        let (winner_index, settled_ts) = match (&race.phase.winner_index(), race.phase.settled_stamp())
        {
            (Some(w), Some(s)) => (*w, s.ts),
            _ => return Ok(()),
        };
        let runner = match race.runners.get(winner_index) {
            Some(r) => r,
            None => return Ok(()),
        };

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT OR REPLACE INTO recent_winners
                (race_id, winner_index, mint, symbol, price_change, settled_ts)
             VALUES (?1,?2,?3,?4,?5,?6)",
        )
        .map_err(sql_err)?
        .execute(params![
            race.id,
            winner_index as i64,
            runner.mint,
            runner.symbol,
            runner.price_change,
            settled_ts,
        ])
        .map_err(sql_err)?;
        Ok(())
    }

    async fn recent_winners(&self, limit: usize) -> EngineResult<Vec<RecentWinner>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM recent_winners ORDER BY settled_ts DESC LIMIT ?1")
            .map_err(sql_err)?;
        let result = Ok(stmt
            .query_map(params![limit as i64], |row| {
                Ok(RecentWinner {
                    race_id: row.get("race_id")?,
                    winner_index: row.get::<_, i64>("winner_index")? as usize,
                    mint: row.get("mint")?,
                    symbol: row.get("symbol")?,
                    price_change: row.get("price_change")?,
                    settled_ts: row.get("settled_ts")?,
                })
            })
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect());
        result
    }

    async fn cleanup_recent_winners(&self, keep: usize) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let removed = conn
            .prepare_cached(
                "DELETE FROM recent_winners WHERE race_id NOT IN
                    (SELECT race_id FROM recent_winners ORDER BY settled_ts DESC LIMIT ?1)",
            )
            .map_err(sql_err)?
            .execute(params![keep as i64])
            .map_err(sql_err)?;
        Ok(removed as u64)
    }

    async fn referral_settings(&self) -> EngineResult<ReferralSettings> {
        let conn = self.conn.lock();
        let result = conn
            .prepare_cached("SELECT * FROM referral_settings WHERE id = 1")
            .map_err(sql_err)?
            .query_row([], |row| {
                Ok(ReferralSettings {
                    enabled: row.get::<_, i64>("enabled")? != 0,
                    level_bps: [
                        row.get::<_, i64>("l1_bps")? as u32,
                        row.get::<_, i64>("l2_bps")? as u32,
                        row.get::<_, i64>("l3_bps")? as u32,
                    ],
                    self_bps: row.get::<_, i64>("self_bps")? as u32,
                    min_payout: dec(&row.get::<_, String>("min_payout")?),
                })
            })
            .map_err(sql_err);
        result
    }

    async fn register_referral_code(&self, wallet: &str, code: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT OR IGNORE INTO referral_codes (code, wallet) VALUES (?1, ?2)",
        )
        .map_err(sql_err)?
        .execute(params![code, wallet])
        .map_err(sql_err)?;
        Ok(())
    }

    async fn wallet_for_code(&self, code: &str) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        let result = match conn
            .prepare_cached("SELECT wallet FROM referral_codes WHERE code = ?1")
            .map_err(sql_err)?
            .query_row(params![code], |row| row.get::<_, String>(0))
        {
            Ok(wallet) => Ok(Some(wallet)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        };
        result
    }

    async fn attribution_for(&self, wallet: &str) -> EngineResult<Option<ReferralAttribution>> {
        let conn = self.conn.lock();
        let result = match conn
            .prepare_cached("SELECT * FROM referral_attributions WHERE wallet = ?1")
            .map_err(sql_err)?
            .query_row(params![wallet], |row| {
                Ok(ReferralAttribution {
                    wallet: row.get("wallet")?,
                    code: row.get("code")?,
                    referrer_wallet: row.get("referrer_wallet")?,
                    attributed_at: row.get("attributed_at")?,
                })
            }) {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(sql_err(e)),
        };
        result
    }

    async fn attribute_wallet(
        &self,
        wallet: &str,
        code: &str,
        referrer: &str,
        now_ms: i64,
    ) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO referral_attributions
                    (wallet, code, referrer_wallet, attributed_at)
                 VALUES (?1,?2,?3,?4)",
            )
            .map_err(sql_err)?
            .execute(params![wallet, code, referrer, now_ms])
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    async fn enqueue_referral_reward(&self, reward: &ReferralReward) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO referral_rewards
                    (id, race_id, from_wallet, to_wallet, level, currency, amount,
                     status, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            )
            .map_err(sql_err)?
            .execute(params![
                reward.id,
                reward.race_id,
                reward.from_wallet,
                reward.to_wallet,
                reward.level as i64,
                reward.currency.as_str(),
                reward.amount.to_string(),
                reward.status.as_str(),
                reward.created_at,
            ])
            .map_err(sql_err)?;
        Ok(changed > 0)
    }

    async fn queued_referral_rewards(&self, limit: usize) -> EngineResult<Vec<ReferralReward>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM referral_rewards WHERE status = 'QUEUED'
                 ORDER BY created_at LIMIT ?1",
            )
            .map_err(sql_err)?;
        let result = Ok(stmt
            .query_map(params![limit as i64], |row| {
                Ok(ReferralReward {
                    id: row.get("id")?,
                    race_id: row.get("race_id")?,
                    from_wallet: row.get("from_wallet")?,
                    to_wallet: row.get("to_wallet")?,
                    level: row.get::<_, i64>("level")? as u8,
                    currency: Currency::from_str(&row.get::<_, String>("currency")?)
                        .unwrap_or(Currency::Sol),
                    amount: dec(&row.get::<_, String>("amount")?),
                    status: match row.get::<_, String>("status")?.as_str() {
                        "PAID" => RewardStatus::Paid,
                        _ => RewardStatus::Queued,
                    },
                    created_at: row.get("created_at")?,
                })
            })
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect());
        result
    }

    async fn mark_rewards_paid(&self, ids: &[String]) -> EngineResult<()> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("UPDATE referral_rewards SET status = 'PAID' WHERE id = ?1")
            .map_err(sql_err)?;
        for id in ids {
            stmt.execute(params![id]).map_err(sql_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sentinel;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory()
    }

    fn runner(i: usize) -> Runner {
        Runner {
            mint: format!("mint{i}"),
            symbol: format!("TOK{i}"),
            name: None,
            pool_address: format!("pool{i}"),
            initial_price: 1.0,
            initial_price_usd: 1.0,
            initial_price_ts: None,
            current_price: 1.0,
            price_change: 0.0,
            logo_uri: None,
        }
    }

    fn open_race(id: &str) -> Race {
        Race {
            id: id.to_string(),
            start_ts: 1_000,
            rake_bps: 500,
            jackpot_flag: false,
            runners: (0..3).map(runner).collect(),
            phase: RacePhase::Open,
            created_at: 900,
        }
    }

    fn wager(sig: &str, race_id: &str, wallet: &str, idx: usize, amount: &str) -> Wager {
        Wager {
            id: format!("w_{sig}"),
            race_id: race_id.to_string(),
            wallet: wallet.to_string(),
            runner_idx: idx,
            amount: dec(amount),
            currency: Currency::Sol,
            sig: sig.to_string(),
            ts: 1_500,
            block_time_ms: None,
            slot: None,
            client_id: None,
            memo: None,
        }
    }

    #[tokio::test]
    async fn race_round_trips_through_phases() {
        let store = store();
        let mut race = open_race("r1");
        store.create_race(&race).await.unwrap();

        race.phase = RacePhase::Locked {
            locked: PhaseStamp {
                ts: 2_000,
                slot: Some(77),
                block_time_ms: Some(2_005),
            },
        };
        store.update_race(&race).await.unwrap();

        let loaded = store.race("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status(), RaceStatus::Locked);
        assert_eq!(loaded.phase.locked_stamp().unwrap().slot, Some(77));

        race.phase = RacePhase::Settled {
            locked: PhaseStamp::at(2_000),
            in_progress: PhaseStamp::at(2_002),
            settled: PhaseStamp::at(3_000),
            winner_index: 1,
            evidence: SettlementEvidence {
                drand_round: None,
                randomness: "[0.0,5.5,-1.0]".into(),
                signature: "price_based_1_5.5000".into(),
            },
            jackpot_added_sol: dec("0.5"),
            jackpot_added_race: Decimal::ZERO,
        };
        store.update_race(&race).await.unwrap();

        let loaded = store.race("r1").await.unwrap().unwrap();
        assert_eq!(loaded.winner_index(), Some(1));
        assert_eq!(
            loaded.phase.evidence().unwrap().signature,
            "price_based_1_5.5000"
        );
        match &loaded.phase {
            RacePhase::Settled {
                jackpot_added_sol, ..
            } => assert_eq!(*jackpot_added_sol, dec("0.5")),
            other => panic!("expected settled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_of_missing_race_errors() {
        let store = store();
        let race = open_race("ghost");
        let err = store.update_race(&race).await.unwrap_err();
        assert!(matches!(err, EngineError::RaceNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_wager_sig_is_typed() {
        let store = store();
        store.create_race(&open_race("r1")).await.unwrap();
        store
            .create_wager(&wager("S1", "r1", "alice", 0, "1.0"))
            .await
            .unwrap();

        let err = store
            .create_wager(&wager("S1", "r1", "bob", 1, "2.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSignature(_)));

        // Exactly one row exists.
        let wagers = store.wagers_by_race("r1").await.unwrap();
        assert_eq!(wagers.len(), 1);
        assert_eq!(wagers[0].wallet, "alice");
    }

    #[tokio::test]
    async fn hydrate_is_insert_or_ignore() {
        let store = store();
        let w = wager("S1", "r1", "alice", 0, "1.0");
        assert!(store.hydrate_wager(&w).await.unwrap());
        assert!(!store.hydrate_wager(&w).await.unwrap());
        assert_eq!(store.wagers_by_race("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reserve_is_first_insert_wins() {
        let store = store();
        assert!(store.reserve("sig1").await.unwrap());
        assert!(!store.reserve("sig1").await.unwrap());
        store.release("sig1").await.unwrap();
        assert!(store.reserve("sig1").await.unwrap());
    }

    #[tokio::test]
    async fn jackpot_adjust_clamps_at_zero() {
        let store = store();
        let (race, sol) = store
            .adjust_jackpot_balances(dec("10"), dec("1.5"))
            .await
            .unwrap();
        assert_eq!(race, dec("10"));
        assert_eq!(sol, dec("1.5"));

        let (race, sol) = store
            .adjust_jackpot_balances(dec("-25"), dec("-1"))
            .await
            .unwrap();
        assert_eq!(race, Decimal::ZERO);
        assert_eq!(sol, dec("0.5"));

        let t = store.treasury().await.unwrap();
        assert_eq!(t.jackpot_balance_race, Decimal::ZERO);
        assert_eq!(t.jackpot_balance_sol, dec("0.5"));
    }

    #[tokio::test]
    async fn treasury_heals_negative_balances() {
        let store = store();
        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE treasury SET jackpot_balance_sol = '-3' WHERE id = 1",
                [],
            )
            .unwrap();
        }
        let t = store.treasury().await.unwrap();
        assert_eq!(t.jackpot_balance_sol, Decimal::ZERO);
    }

    #[tokio::test]
    async fn transfer_upsert_and_retry_listing() {
        let store = store();
        let t = SettlementTransfer {
            id: "payout_SOL_r1_alice".into(),
            race_id: "r1".into(),
            transfer_type: TransferType::Payout,
            to_wallet: "alice".into(),
            amount: dec("1.425"),
            tx_sig: None,
            currency: Currency::Sol,
            ts: 10,
            status: TransferStatus::Pending,
            attempts: 0,
            last_error: None,
            batch_id: Some("b1".into()),
            is_refund: false,
        };
        store.record_transfer(&t).await.unwrap();

        let pending = store.failed_or_pending_transfers(10).await.unwrap();
        assert_eq!(pending.len(), 1);

        store
            .update_transfer_status(
                &t.id,
                TransferStatus::Success,
                TransferUpdate {
                    tx_sig: Some("sig123".into()),
                    error: None,
                    inc_attempts: true,
                },
            )
            .await
            .unwrap();

        assert!(store
            .failed_or_pending_transfers(10)
            .await
            .unwrap()
            .is_empty());
        let found = store
            .transfer_for_race_and_wallet("r1", "alice", Currency::Sol)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status, TransferStatus::Success);
        assert_eq!(found.tx_sig.as_deref(), Some("sig123"));
        assert_eq!(found.attempts, 1);
    }

    #[tokio::test]
    async fn projections_rebuild_when_stale() {
        let store = store();
        let result = UserRaceResult {
            id: "res1".into(),
            wallet: "alice".into(),
            race_id: "r1".into(),
            currency: Currency::Sol,
            wagered: dec("1"),
            payout: dec("1.425"),
            won: true,
            refund: false,
            edge_points: dec("0.425"),
            ts: 10,
        };
        store.upsert_user_race_result(&result).await.unwrap();
        // Applying twice equals once.
        store.upsert_user_race_result(&result).await.unwrap();

        assert!(store.rebuild_stale_projections().await.unwrap());
        assert!(!store.rebuild_stale_projections().await.unwrap());

        let board = store.leaderboard(10).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].races, 1);
        assert_eq!(board[0].net, dec("0.425"));
        assert_eq!(store.user_rank("alice").await.unwrap(), Some(1));
        assert_eq!(store.user_rank("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn recent_winners_only_records_settled_with_winner() {
        let store = store();
        let mut race = open_race("r1");
        store.create_race(&race).await.unwrap();

        // Open race: ignored.
        store.add_recent_winner(&race).await.unwrap();
        assert!(store.recent_winners(10).await.unwrap().is_empty());

        race.phase = RacePhase::Settled {
            locked: PhaseStamp::at(1),
            in_progress: PhaseStamp::at(2),
            settled: PhaseStamp::at(3),
            winner_index: 2,
            evidence: SettlementEvidence {
                drand_round: None,
                randomness: "[]".into(),
                signature: "price_based_2_1.0000".into(),
            },
            jackpot_added_sol: Decimal::ZERO,
            jackpot_added_race: Decimal::ZERO,
        };
        store.add_recent_winner(&race).await.unwrap();
        let winners = store.recent_winners(10).await.unwrap();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].mint, "mint2");
    }

    #[tokio::test]
    async fn referral_attribution_is_first_click_wins() {
        let store = store();
        store.register_referral_code("carol", "CAROL1").await.unwrap();
        assert_eq!(
            store.wallet_for_code("CAROL1").await.unwrap().as_deref(),
            Some("carol")
        );

        assert!(store
            .attribute_wallet("alice", "CAROL1", "carol", 10)
            .await
            .unwrap());
        // Second attribution attempt loses.
        assert!(!store
            .attribute_wallet("alice", "OTHER", "dave", 20)
            .await
            .unwrap());

        let a = store.attribution_for("alice").await.unwrap().unwrap();
        assert_eq!(a.referrer_wallet, "carol");
    }

    #[tokio::test]
    async fn referral_rewards_dedupe_by_id() {
        let store = store();
        let reward = ReferralReward {
            id: format!("ref_r1_alice_{}_1", sentinel::ESCROW),
            race_id: "r1".into(),
            from_wallet: "alice".into(),
            to_wallet: sentinel::ESCROW.into(),
            level: 1,
            currency: Currency::Sol,
            amount: dec("0.01"),
            status: RewardStatus::Queued,
            created_at: 5,
        };
        assert!(store.enqueue_referral_reward(&reward).await.unwrap());
        assert!(!store.enqueue_referral_reward(&reward).await.unwrap());

        let queued = store.queued_referral_rewards(10).await.unwrap();
        assert_eq!(queued.len(), 1);

        store.mark_rewards_paid(&[reward.id.clone()]).await.unwrap();
        assert!(store.queued_referral_rewards(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn seen_tx_gc_drops_old_entries() {
        let store = store();
        store.reserve("old").await.unwrap();
        {
            let conn = store.conn.lock();
            conn.execute("UPDATE seen_tx SET seen_at = 1 WHERE sig = 'old'", [])
                .unwrap();
        }
        store.reserve("fresh").await.unwrap();

        let removed = store.cleanup_seen(now_wall_ms() - 1000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.has_seen("old").await.unwrap());
        assert!(store.has_seen("fresh").await.unwrap());
    }
}
