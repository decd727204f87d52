//! Store schema, grounded on `db_storage.rs`'s `SCHEMA_SQL` const (same pragmas, same
//! `WITHOUT ROWID` + covering-index technique, applied to the bar tables from §6).

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 268435456;

CREATE TABLE IF NOT EXISTS bars_1m (
    market TEXT NOT NULL,
    provider TEXT NOT NULL,
    symbol TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (market, provider, symbol, ts_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_1m_recent
    ON bars_1m(market, provider, symbol, ts_ms DESC);

CREATE TABLE IF NOT EXISTS bars_5m (
    market TEXT NOT NULL,
    provider TEXT NOT NULL,
    symbol TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (market, provider, symbol, ts_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_5m_recent
    ON bars_5m(market, provider, symbol, ts_ms DESC);

CREATE TABLE IF NOT EXISTS bars_1h (
    market TEXT NOT NULL,
    provider TEXT NOT NULL,
    symbol TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (market, provider, symbol, ts_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_1h_recent
    ON bars_1h(market, provider, symbol, ts_ms DESC);

CREATE TABLE IF NOT EXISTS bars_1d (
    market TEXT NOT NULL,
    provider TEXT NOT NULL,
    symbol TEXT NOT NULL,
    ts_ms INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (market, provider, symbol, ts_ms)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_1d_recent
    ON bars_1d(market, provider, symbol, ts_ms DESC);
"#;
