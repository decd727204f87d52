//! Persistent 1m bar store (§4.2), a `rusqlite` WAL-mode SQLite store.
//!
//! Grounded on `db_storage.rs`'s `DbSignalStorage`: the same performance pragmas
//! (`WAL`/`synchronous=NORMAL`/`cache_size`/`mmap_size`), `WITHOUT ROWID` tables keyed on the
//! natural primary key, covering indexes, and an `Arc<parking_lot::Mutex<Connection>>` wrapper
//! since `rusqlite::Connection` is `!Sync`.

mod schema;

use crate::bar::Bar;
use crate::error::EngineError;
use crate::timeframe::Timeframe;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

pub use schema::SCHEMA_SQL;

/// Sentinel returned by [`Store::fetch_aggregate`] when the deployment has no materialized view
/// for the requested timeframe; callers fall back to resample-from-1m (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotMaterialized;

#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub limit: Option<u32>,
}

impl Window {
    pub fn unbounded() -> Self {
        Self {
            since_ms: None,
            until_ms: None,
            limit: None,
        }
    }
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    insert_batch_size: usize,
}

impl Store {
    pub fn open(db_path: &str, insert_batch_size: usize) -> Result<Self, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| EngineError::StoreCorrupt(format!("open {db_path}: {e}")))?;

        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| EngineError::StoreCorrupt(format!("schema init: {e}")))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode, "WAL mode not active");
        }

        info!(path = db_path, "bar store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            insert_batch_size,
        })
    }

    /// Idempotent upsert on `(market, provider, symbol, ts_ms)` for the 1m timeframe, batched
    /// in transactions of `insert_batch_size` rows.
    ///
    /// Bars failing the persisted-bar invariant (§3: `low <= open,close <= high`, `volume >=
    /// 0`) are rejected at ingest rather than written: each is logged with a `warn!` and
    /// dropped before touching the database.
    pub fn insert_1m(
        &self,
        market: &str,
        provider: &str,
        symbol: &str,
        bars: &[Bar],
    ) -> Result<usize, EngineError> {
        if bars.is_empty() {
            return Ok(0);
        }
        let mut valid_bars = Vec::with_capacity(bars.len());
        for bar in bars {
            if bar.is_valid() {
                valid_bars.push(bar);
            } else {
                warn!(market, provider, symbol, ts_ms = bar.ts_ms, ?bar, "rejecting invalid bar at ingest");
            }
        }
        if valid_bars.is_empty() {
            return Ok(0);
        }
        let bars = valid_bars;
        let conn = self.conn.lock();
        let mut inserted = 0usize;
        for chunk in bars.chunks(self.insert_batch_size.max(1)) {
            conn.execute("BEGIN IMMEDIATE", [])
                .map_err(EngineError::from)?;
            let mut result = Ok(());
            for bar in chunk {
                match conn.execute(
                    "INSERT INTO bars_1m (market, provider, symbol, ts_ms, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(market, provider, symbol, ts_ms) DO UPDATE SET
                        open = excluded.open, high = excluded.high, low = excluded.low,
                        close = excluded.close, volume = excluded.volume",
                    params![
                        market, provider, symbol, bar.ts_ms, bar.open, bar.high, bar.low,
                        bar.close, bar.volume,
                    ],
                ) {
                    Ok(changes) => inserted += changes,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            match result {
                Ok(()) => {
                    conn.execute("COMMIT", []).map_err(EngineError::from)?;
                }
                Err(e) => {
                    conn.execute("ROLLBACK", []).ok();
                    return Err(e.into());
                }
            }
        }
        Ok(inserted)
    }

    pub fn fetch_1m(
        &self,
        market: &str,
        provider: &str,
        symbol: &str,
        window: Window,
    ) -> Result<Vec<Bar>, EngineError> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT ts_ms, open, high, low, close, volume FROM bars_1m
             WHERE market = ? AND provider = ? AND symbol = ?",
        );
        if window.since_ms.is_some() {
            sql.push_str(" AND ts_ms >= ?");
        }
        if window.until_ms.is_some() {
            sql.push_str(" AND ts_ms < ?");
        }
        sql.push_str(" ORDER BY ts_ms ASC");
        if window.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut stmt = conn.prepare(&sql).map_err(EngineError::from)?;
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(market.to_string()), Box::new(provider.to_string()), Box::new(symbol.to_string())];
        if let Some(since) = window.since_ms {
            bound.push(Box::new(since));
        }
        if let Some(until) = window.until_ms {
            bound.push(Box::new(until));
        }
        if let Some(limit) = window.limit {
            bound.push(Box::new(limit));
        }

        let params_ref: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), row_to_bar)
            .map_err(EngineError::from)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(EngineError::from)?);
        }
        Ok(out)
    }

    /// Queries the materialized view for `tf` if the deployment has created one; `Ok(None)`
    /// means "no view for this timeframe", and the orchestrator falls back to resampling 1m
    /// bars per §4.5 stage 3.
    pub fn fetch_aggregate(
        &self,
        market: &str,
        provider: &str,
        symbol: &str,
        tf: Timeframe,
        window: Window,
    ) -> Result<Option<Vec<Bar>>, EngineError> {
        let table = match tf.to_string().as_str() {
            "5m" => "bars_5m",
            "1h" => "bars_1h",
            "1d" => "bars_1d",
            _ => return Ok(None),
        };

        let conn = self.conn.lock();
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1",
                params![table],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if !exists {
            return Ok(None);
        }

        let sql = format!(
            "SELECT ts_ms, open, high, low, close, volume FROM {table}
             WHERE market = ? AND provider = ? AND symbol = ?
             {since} {until} ORDER BY ts_ms ASC {limit}",
            since = if window.since_ms.is_some() { "AND ts_ms >= ?" } else { "" },
            until = if window.until_ms.is_some() { "AND ts_ms < ?" } else { "" },
            limit = window
                .limit
                .map(|l| format!("LIMIT {l}"))
                .unwrap_or_default(),
        );

        let mut stmt = conn.prepare(&sql).map_err(EngineError::from)?;
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(market.to_string()), Box::new(provider.to_string()), Box::new(symbol.to_string())];
        if let Some(since) = window.since_ms {
            bound.push(Box::new(since));
        }
        if let Some(until) = window.until_ms {
            bound.push(Box::new(until));
        }
        let params_ref: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), row_to_bar)
            .map_err(EngineError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(EngineError::from)?);
        }
        Ok(Some(out))
    }

    /// Contiguous `[gap_start, gap_end]` ranges (1m-aligned, inclusive) with no stored row,
    /// derived by diffing existing timestamps against the regular 60_000ms grid (§4.2).
    pub fn find_missing_1m_ranges(
        &self,
        market: &str,
        provider: &str,
        symbol: &str,
        earliest_ms: i64,
        latest_ms: i64,
    ) -> Result<Vec<(i64, i64)>, EngineError> {
        const STEP: i64 = 60_000;
        if earliest_ms > latest_ms {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT ts_ms FROM bars_1m
                 WHERE market = ?1 AND provider = ?2 AND symbol = ?3
                   AND ts_ms >= ?4 AND ts_ms <= ?5
                 ORDER BY ts_ms ASC",
            )
            .map_err(EngineError::from)?;
        let existing: std::collections::BTreeSet<i64> = stmt
            .query_map(params![market, provider, symbol, earliest_ms, latest_ms], |r| r.get(0))
            .map_err(EngineError::from)?
            .collect::<Result<_, _>>()
            .map_err(EngineError::from)?;

        let aligned_start = (earliest_ms / STEP) * STEP;
        let aligned_end = (latest_ms / STEP) * STEP;

        let mut ranges = Vec::new();
        let mut gap_start: Option<i64> = None;
        let mut ts = aligned_start;
        while ts <= aligned_end {
            if existing.contains(&ts) {
                if let Some(start) = gap_start.take() {
                    ranges.push((start, ts - STEP));
                }
            } else if gap_start.is_none() {
                gap_start = Some(ts);
            }
            ts += STEP;
        }
        if let Some(start) = gap_start {
            ranges.push((start, aligned_end));
        }
        Ok(ranges)
    }
}

fn row_to_bar(row: &rusqlite::Row) -> rusqlite::Result<Bar> {
    Ok(Bar {
        ts_ms: row.get(0)?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        volume: row.get(5)?,
    })
}
