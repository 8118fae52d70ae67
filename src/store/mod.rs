//! SQLite-backed durable state.
//!
//! Positions are stored as JSON rows keyed by id; closing a position moves it
//! into `position_history` inside one transaction. The action log is
//! append-only. On startup `load_positions` returns exactly the open set
//! from the last consistent state.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::model::CombinedPosition;

/// Durable position + action-history store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the store at the given path.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("State store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            r#"
            -- Open and closing positions
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                data TEXT NOT NULL,
                is_closed INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id);
            CREATE INDEX IF NOT EXISTS idx_positions_closed ON positions(is_closed);

            -- Terminal position records
            CREATE TABLE IF NOT EXISTS position_history (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                status TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                pnl_usd TEXT,
                funding_earned_usd TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_history_user ON position_history(user_id);

            -- Append-only action log
            CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                type TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_action_log_timestamp ON action_log(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside one transaction; commits on Ok, rolls back on Err.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Upsert a position.
    pub fn save_position(&self, position: &CombinedPosition) -> Result<()> {
        self.with_transaction(|tx| Self::save_position_tx(tx, position))
    }

    /// Upsert a position inside an existing transaction.
    pub fn save_position_tx(tx: &Transaction, position: &CombinedPosition) -> Result<()> {
        let data = serde_json::to_string(position).context("Failed to serialize position")?;
        tx.execute(
            r#"
            INSERT INTO positions (id, user_id, data, is_closed, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            ON CONFLICT(id) DO UPDATE SET
                user_id = ?2,
                data = ?3,
                updated_at = ?4
            "#,
            params![
                position.position_id.to_string(),
                position.user_id,
                data,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load open positions, optionally for one user.
    pub fn load_positions(&self, user_id: Option<&str>) -> Result<Vec<CombinedPosition>> {
        let conn = self.conn.lock().expect("store mutex poisoned");

        let (sql, bind): (&str, Vec<&dyn rusqlite::ToSql>) = match user_id.as_ref() {
            Some(user) => (
                "SELECT data FROM positions WHERE is_closed = 0 AND user_id = ?1",
                vec![user],
            ),
            None => ("SELECT data FROM positions WHERE is_closed = 0", vec![]),
        };

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(&bind[..], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        rows.iter()
            .map(|data| serde_json::from_str(data).context("Failed to deserialize stored position"))
            .collect()
    }

    /// Move a position to history: mark the row closed and insert the
    /// terminal record, in one transaction.
    pub fn archive_position(&self, position: &CombinedPosition, pnl_usd: Decimal) -> Result<()> {
        self.with_transaction(|tx| Self::archive_position_tx(tx, position, pnl_usd))
    }

    /// Archive inside an existing transaction.
    pub fn archive_position_tx(
        tx: &Transaction,
        position: &CombinedPosition,
        pnl_usd: Decimal,
    ) -> Result<()> {
        // Keep the final JSON alongside the closed flag for postmortems.
        Self::save_position_tx(tx, position)?;
        tx.execute(
            "UPDATE positions SET is_closed = 1, updated_at = ?2 WHERE id = ?1",
            params![position.position_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO position_history
                (id, user_id, asset, status, opened_at, closed_at, pnl_usd, funding_earned_usd)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                position.position_id.to_string(),
                position.user_id,
                position.long_leg.asset.symbol(),
                serde_json::to_string(&position.status)?.trim_matches('"'),
                position.created_at.to_rfc3339(),
                position.exit_time.map(|t| t.to_rfc3339()),
                pnl_usd.to_string(),
                position.net_funding_usd().to_string(),
            ],
        )?;
        Ok(())
    }

    /// Append to the action log.
    pub fn log_action(&self, action_type: &str, payload: &serde_json::Value) -> Result<()> {
        self.with_transaction(|tx| Self::log_action_tx(tx, action_type, payload))
    }

    /// Append to the action log inside an existing transaction.
    pub fn log_action_tx(
        tx: &Transaction,
        action_type: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO action_log (timestamp, type, payload) VALUES (?1, ?2, ?3)",
            params![
                Utc::now().to_rfc3339(),
                action_type,
                serde_json::to_string(payload)?,
            ],
        )?;
        Ok(())
    }

    /// Count open positions across all tenants.
    pub fn count_open_positions(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE is_closed = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Recent action-log entries, newest first.
    pub fn recent_actions(&self, limit: usize) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT timestamp, type, payload FROM action_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Closed-position summaries, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryRow>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, asset, status, opened_at, closed_at, pnl_usd, funding_earned_usd
            FROM position_history ORDER BY closed_at DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(HistoryRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    asset: row.get(2)?,
                    status: row.get(3)?,
                    opened_at: row.get(4)?,
                    closed_at: row.get(5)?,
                    pnl_usd: row.get(6)?,
                    funding_earned_usd: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// One row of the history table.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub id: String,
    pub user_id: String,
    pub asset: String,
    pub status: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub pnl_usd: Option<String>,
    pub funding_earned_usd: Option<String>,
}
