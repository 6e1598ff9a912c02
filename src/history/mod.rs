//! SQLite-backed append-only history of control-loop outcomes.
//!
//! The exchange remains the source of truth; a failed write here is
//! logged and never blocks a tick.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// One executed margin move.
#[derive(Debug, Clone)]
pub struct AdjustmentRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub delta: Decimal,
    /// Margin rate after planning, for later inspection
    pub margin_after: Decimal,
}

/// One partial close, planned or executed.
#[derive(Debug, Clone)]
pub struct LiquidationRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub close_quantity: Decimal,
    pub estimated_released: Decimal,
    pub dry_run: bool,
}

/// Account-level state captured once per tick.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_margin: Decimal,
    pub available_balance: Decimal,
    pub total_equity: Decimal,
    pub position_count: u32,
}

/// Append-only, thread-safe record store.
pub trait HistorySink: Send + Sync {
    fn record_adjustment(&self, record: &AdjustmentRecord) -> Result<()>;
    fn record_liquidation(&self, record: &LiquidationRecord) -> Result<()>;
    fn record_snapshot(&self, snapshot: &AccountSnapshot) -> Result<()>;
}

/// SQLite implementation of the history sink.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let history = Self {
            conn: Mutex::new(conn),
        };
        history.init_schema()?;

        info!("History sink initialized at {:?}", db_path.as_ref());
        Ok(history)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS adjustments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                delta TEXT NOT NULL,
                margin_after TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_adjustments_timestamp ON adjustments(timestamp);
            CREATE INDEX IF NOT EXISTS idx_adjustments_symbol ON adjustments(symbol);

            CREATE TABLE IF NOT EXISTS liquidations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                close_quantity TEXT NOT NULL,
                estimated_released TEXT NOT NULL,
                dry_run INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_liquidations_timestamp ON liquidations(timestamp);

            CREATE TABLE IF NOT EXISTS account_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                total_margin TEXT NOT NULL,
                available_balance TEXT NOT NULL,
                total_equity TEXT NOT NULL,
                position_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON account_snapshots(timestamp);
            "#,
        )
        .context("Failed to initialize history schema")?;

        Ok(())
    }
}

impl HistorySink for SqliteHistory {
    fn record_adjustment(&self, record: &AdjustmentRecord) -> Result<()> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute(
            "INSERT INTO adjustments (timestamp, symbol, delta, margin_after)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.timestamp.to_rfc3339(),
                record.symbol,
                record.delta.to_string(),
                record.margin_after.to_string(),
            ],
        )
        .context("Failed to record adjustment")?;
        Ok(())
    }

    fn record_liquidation(&self, record: &LiquidationRecord) -> Result<()> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute(
            "INSERT INTO liquidations (timestamp, symbol, close_quantity, estimated_released, dry_run)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.timestamp.to_rfc3339(),
                record.symbol,
                record.close_quantity.to_string(),
                record.estimated_released.to_string(),
                record.dry_run as i64,
            ],
        )
        .context("Failed to record liquidation")?;
        Ok(())
    }

    fn record_snapshot(&self, snapshot: &AccountSnapshot) -> Result<()> {
        let conn = self.conn.lock().expect("history lock poisoned");
        conn.execute(
            "INSERT INTO account_snapshots
             (timestamp, total_margin, available_balance, total_equity, position_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.timestamp.to_rfc3339(),
                snapshot.total_margin.to_string(),
                snapshot.available_balance.to_string(),
                snapshot.total_equity.to_string(),
                snapshot.position_count,
            ],
        )
        .context("Failed to record snapshot")?;
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryHistory {
    pub adjustments: Mutex<Vec<AdjustmentRecord>>,
    pub liquidations: Mutex<Vec<LiquidationRecord>>,
    pub snapshots: Mutex<Vec<AccountSnapshot>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistorySink for MemoryHistory {
    fn record_adjustment(&self, record: &AdjustmentRecord) -> Result<()> {
        self.adjustments
            .lock()
            .expect("lock poisoned")
            .push(record.clone());
        Ok(())
    }

    fn record_liquidation(&self, record: &LiquidationRecord) -> Result<()> {
        self.liquidations
            .lock()
            .expect("lock poisoned")
            .push(record.clone());
        Ok(())
    }

    fn record_snapshot(&self, snapshot: &AccountSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .expect("lock poisoned")
            .push(snapshot.clone());
        Ok(())
    }
}
