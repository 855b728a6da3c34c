//! SQLite adapter: price history, accounts, score snapshots, backtest
//! results and automated-trading rules in one database file, behind an r2d2
//! connection pool.

use crate::domain::account::{Account, AccountId, Position, Trade, TradeSide};
use crate::domain::auto_trading::{AutoTradingRule, RuleId, RuleSettings};
use crate::domain::backtest::{BacktestParams, BacktestResult, MarkFallback};
use crate::domain::config_validation;
use crate::domain::error::PapertraderError;
use crate::domain::ledger::{Execution, PositionUpdate};
use crate::domain::ohlcv::{Instrument, InstrumentId, OhlcvBar};
use crate::domain::scoring::{ScoreSnapshot, Signal};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::MarketDataPort;
use crate::ports::repository_port::{
    AccountRepository, BacktestRepository, PlanFn, RuleRepository, ScoreRepository,
};
use chrono::{NaiveDate, NaiveDateTime};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS instruments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS prices (
    instrument_id INTEGER NOT NULL REFERENCES instruments(id),
    date TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    PRIMARY KEY (instrument_id, date)
);
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    initial_balance REAL NOT NULL,
    current_balance REAL NOT NULL,
    total_profit_loss REAL NOT NULL DEFAULT 0,
    total_trades INTEGER NOT NULL DEFAULT 0,
    win_trades INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS positions (
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    instrument_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    avg_price REAL NOT NULL,
    current_price REAL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, instrument_id)
);
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    instrument_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    price REAL NOT NULL,
    total_amount REAL NOT NULL,
    commission REAL NOT NULL,
    tax REAL NOT NULL,
    realized_pnl REAL,
    executed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_account ON trades(account_id, id);
CREATE TABLE IF NOT EXISTS score_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    date TEXT NOT NULL,
    rsi_score REAL NOT NULL,
    macd_score REAL NOT NULL,
    bollinger_score REAL NOT NULL,
    ema_score REAL NOT NULL,
    prediction_score REAL NOT NULL,
    total_score REAL NOT NULL,
    signal TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scores_instrument ON score_snapshots(instrument_id, id);
CREATE TABLE IF NOT EXISTS backtest_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_name TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    initial_balance REAL NOT NULL,
    buy_threshold REAL NOT NULL,
    sell_threshold REAL NOT NULL,
    max_positions INTEGER NOT NULL,
    budget_ratio REAL NOT NULL,
    mark_fallback TEXT NOT NULL,
    final_balance REAL NOT NULL,
    total_return REAL NOT NULL,
    sharpe_ratio REAL NOT NULL,
    max_drawdown REAL NOT NULL,
    win_rate REAL NOT NULL,
    total_trades INTEGER NOT NULL,
    win_trades INTEGER NOT NULL,
    stale_marks INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS backtest_trades (
    backtest_id INTEGER NOT NULL REFERENCES backtest_results(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    instrument_id INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    price REAL NOT NULL,
    total_amount REAL NOT NULL,
    commission REAL NOT NULL,
    tax REAL NOT NULL,
    realized_pnl REAL,
    executed_at TEXT NOT NULL,
    PRIMARY KEY (backtest_id, seq)
);
CREATE TABLE IF NOT EXISTS auto_trading_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    strategy_type TEXT NOT NULL,
    account_id INTEGER NOT NULL,
    buy_score_threshold REAL NOT NULL,
    max_position_count INTEGER NOT NULL,
    budget_ratio REAL NOT NULL,
    schedule_buy TEXT,
    schedule_sell TEXT,
    is_active INTEGER NOT NULL,
    last_executed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

fn pool_err(e: r2d2::Error) -> PapertraderError {
    PapertraderError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> PapertraderError {
    PapertraderError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn conversion_failure(
    value: &str,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(value.len(), rusqlite::types::Type::Text, Box::new(e))
}

fn date_col(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, DATE_FORMAT).map_err(|e| conversion_failure(&s, e))
}

fn datetime_col(row: &Row, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let s: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).map_err(|e| conversion_failure(&s, e))
}

fn opt_datetime_col(row: &Row, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).map_err(|e| conversion_failure(&s, e)))
        .transpose()
}

fn parsed_col<T: FromStr<Err = PapertraderError>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_failure(&s, e))
}

fn count_col(row: &Row, idx: usize) -> rusqlite::Result<usize> {
    let n: i64 = row.get(idx)?;
    Ok(n.max(0) as usize)
}

fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn fmt_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

const ACCOUNT_COLUMNS: &str = "id, name, initial_balance, current_balance, total_profit_loss, \
     total_trades, win_trades, created_at, updated_at";

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        initial_balance: row.get(2)?,
        current_balance: row.get(3)?,
        total_profit_loss: row.get(4)?,
        total_trades: count_col(row, 5)?,
        win_trades: count_col(row, 6)?,
        created_at: datetime_col(row, 7)?,
        updated_at: datetime_col(row, 8)?,
    })
}

const POSITION_COLUMNS: &str =
    "account_id, instrument_id, symbol, quantity, avg_price, current_price, updated_at";

fn position_from_row(row: &Row) -> rusqlite::Result<Position> {
    Ok(Position {
        account_id: row.get(0)?,
        instrument_id: row.get(1)?,
        symbol: row.get(2)?,
        quantity: row.get(3)?,
        avg_price: row.get(4)?,
        current_price: row.get(5)?,
        updated_at: datetime_col(row, 6)?,
    })
}

/// Trade columns after the leading id/owner column.
const TRADE_COLUMNS: &str = "instrument_id, symbol, side, quantity, price, total_amount, \
     commission, tax, realized_pnl, executed_at";

/// `row` holds the trade id at 0, account id at 1, then `TRADE_COLUMNS`.
fn trade_from_row(row: &Row) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get(0)?,
        account_id: row.get(1)?,
        instrument_id: row.get(2)?,
        symbol: row.get(3)?,
        side: parsed_col::<TradeSide>(row, 4)?,
        quantity: row.get(5)?,
        price: row.get(6)?,
        total_amount: row.get(7)?,
        commission: row.get(8)?,
        tax: row.get(9)?,
        realized_pnl: row.get(10)?,
        executed_at: datetime_col(row, 11)?,
    })
}

const SCORE_COLUMNS: &str = "id, instrument_id, symbol, date, rsi_score, macd_score, \
     bollinger_score, ema_score, prediction_score, total_score, signal";

fn score_from_row(row: &Row) -> rusqlite::Result<ScoreSnapshot> {
    Ok(ScoreSnapshot {
        id: row.get(0)?,
        instrument_id: row.get(1)?,
        symbol: row.get(2)?,
        date: date_col(row, 3)?,
        rsi_score: row.get(4)?,
        macd_score: row.get(5)?,
        bollinger_score: row.get(6)?,
        ema_score: row.get(7)?,
        prediction_score: row.get(8)?,
        total_score: row.get(9)?,
        signal: parsed_col::<Signal>(row, 10)?,
    })
}

const BACKTEST_COLUMNS: &str = "id, strategy_name, start_date, end_date, initial_balance, \
     buy_threshold, sell_threshold, max_positions, budget_ratio, mark_fallback, final_balance, \
     total_return, sharpe_ratio, max_drawdown, win_rate, total_trades, win_trades, stale_marks, \
     created_at";

/// Summary columns only; trades are loaded separately and the equity curve
/// is not stored.
fn backtest_from_row(row: &Row) -> rusqlite::Result<BacktestResult> {
    Ok(BacktestResult {
        id: row.get(0)?,
        params: BacktestParams {
            strategy_name: row.get(1)?,
            start_date: date_col(row, 2)?,
            end_date: date_col(row, 3)?,
            initial_balance: row.get(4)?,
            buy_threshold: row.get(5)?,
            sell_threshold: row.get(6)?,
            max_positions: count_col(row, 7)?,
            budget_ratio: row.get(8)?,
            mark_fallback: parsed_col::<MarkFallback>(row, 9)?,
        },
        final_balance: row.get(10)?,
        total_return: row.get(11)?,
        sharpe_ratio: row.get(12)?,
        max_drawdown: row.get(13)?,
        win_rate: row.get(14)?,
        total_trades: count_col(row, 15)?,
        win_trades: count_col(row, 16)?,
        stale_marks: count_col(row, 17)?,
        trades: Vec::new(),
        equity_curve: Vec::new(),
        created_at: datetime_col(row, 18)?,
    })
}

const RULE_COLUMNS: &str = "id, name, strategy_type, account_id, buy_score_threshold, \
     max_position_count, budget_ratio, schedule_buy, schedule_sell, is_active, last_executed_at, \
     created_at, updated_at";

fn rule_from_row(row: &Row) -> rusqlite::Result<AutoTradingRule> {
    Ok(AutoTradingRule {
        id: row.get(0)?,
        name: row.get(1)?,
        strategy_type: row.get(2)?,
        account_id: row.get(3)?,
        buy_score_threshold: row.get(4)?,
        max_position_count: count_col(row, 5)?,
        budget_ratio: row.get(6)?,
        schedule_buy: row.get(7)?,
        schedule_sell: row.get(8)?,
        is_active: row.get(9)?,
        last_executed_at: opt_datetime_col(row, 10)?,
        created_at: datetime_col(row, 11)?,
        updated_at: datetime_col(row, 12)?,
    })
}

fn load_account(conn: &Connection, account_id: AccountId) -> Result<Option<Account>, PapertraderError> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
        params![account_id],
        account_from_row,
    )
    .optional()
    .map_err(query_err)
}

fn load_position(
    conn: &Connection,
    account_id: AccountId,
    instrument_id: InstrumentId,
) -> Result<Option<Position>, PapertraderError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM positions WHERE account_id = ?1 AND instrument_id = ?2",
            POSITION_COLUMNS
        ),
        params![account_id, instrument_id],
        position_from_row,
    )
    .optional()
    .map_err(query_err)
}

/// Write account, position and trade of `execution` on `conn`, which the
/// caller holds inside a transaction.
fn write_execution(conn: &Connection, execution: &Execution) -> Result<Trade, PapertraderError> {
    let account = &execution.account;

    let updated = conn
        .execute(
            "UPDATE accounts SET current_balance = ?1, total_profit_loss = ?2,
                 total_trades = ?3, win_trades = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                account.current_balance,
                account.total_profit_loss,
                account.total_trades as i64,
                account.win_trades as i64,
                fmt_datetime(account.updated_at),
                account.id
            ],
        )
        .map_err(query_err)?;
    if updated == 0 {
        return Err(PapertraderError::AccountNotFound {
            account_id: account.id,
        });
    }

    match &execution.position {
        PositionUpdate::Upsert(pos) => {
            conn.execute(
                "INSERT OR REPLACE INTO positions
                     (account_id, instrument_id, symbol, quantity, avg_price, current_price, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    account.id,
                    pos.instrument_id,
                    pos.symbol,
                    pos.quantity,
                    pos.avg_price,
                    pos.current_price,
                    fmt_datetime(pos.updated_at)
                ],
            )
            .map_err(query_err)?;
        }
        PositionUpdate::Remove(instrument_id) => {
            conn.execute(
                "DELETE FROM positions WHERE account_id = ?1 AND instrument_id = ?2",
                params![account.id, instrument_id],
            )
            .map_err(query_err)?;
        }
    }

    let t = &execution.trade;
    conn.execute(
        &format!(
            "INSERT INTO trades (account_id, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            TRADE_COLUMNS
        ),
        params![
            account.id,
            t.instrument_id,
            t.symbol,
            t.side.to_string(),
            t.quantity,
            t.price,
            t.total_amount,
            t.commission,
            t.tax,
            t.realized_pnl,
            fmt_datetime(t.executed_at)
        ],
    )
    .map_err(query_err)?;

    let mut trade = t.clone();
    trade.id = Some(conn.last_insert_rowid());
    Ok(trade)
}

fn bar_from_row(row: &Row) -> rusqlite::Result<OhlcvBar> {
    Ok(OhlcvBar {
        instrument_id: row.get(0)?,
        symbol: row.get(1)?,
        date: date_col(row, 2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
    })
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, PapertraderError> {
        let db_path = config
            .get_string("database", "path")
            .ok_or_else(|| PapertraderError::ConfigMissing {
                section: "database".into(),
                key: "path".into(),
            })?;
        let pool_size = config_validation::pool_size(config)?;
        Self::open(&db_path, pool_size)
    }

    /// Open (creating if needed) the database file and its schema.
    pub fn open(path: &str, pool_size: u32) -> Result<Self, PapertraderError> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(pool_err)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    /// Private in-memory database. Single connection, since every SQLite
    /// memory connection is its own database.
    pub fn in_memory() -> Result<Self, PapertraderError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(pool_err)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, PapertraderError> {
        self.pool.get().map_err(pool_err)
    }

    pub fn initialize_schema(&self) -> Result<(), PapertraderError> {
        self.conn()?.execute_batch(SCHEMA).map_err(query_err)
    }

    /// Register `symbol` if unknown and return it with its id.
    pub fn upsert_instrument(&self, symbol: &str, name: &str) -> Result<Instrument, PapertraderError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO instruments (symbol, name) VALUES (?1, ?2)",
            params![symbol, name],
        )
        .map_err(query_err)?;

        conn.query_row(
            "SELECT id, symbol, name FROM instruments WHERE symbol = ?1",
            params![symbol],
            |row| {
                Ok(Instrument {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
        .map_err(query_err)
    }

    /// Insert or replace bars in one transaction.
    pub fn insert_bars(&self, bars: &[OhlcvBar]) -> Result<usize, PapertraderError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;

        for bar in bars {
            tx.execute(
                "INSERT OR REPLACE INTO prices (instrument_id, date, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    bar.instrument_id,
                    fmt_date(bar.date),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ],
            )
            .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        Ok(bars.len())
    }

    fn backtest_trades(&self, backtest_id: i64) -> Result<Vec<Trade>, PapertraderError> {
        let conn = self.conn()?;
        let query = format!(
            "SELECT NULL, 0, {} FROM backtest_trades WHERE backtest_id = ?1 ORDER BY seq",
            TRADE_COLUMNS
        );
        let mut stmt = conn.prepare(&query).map_err(query_err)?;
        let rows = stmt
            .query_map(params![backtest_id], trade_from_row)
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }
}

impl MarketDataPort for SqliteAdapter {
    fn list_instruments(&self) -> Result<Vec<Instrument>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, symbol, name FROM instruments ORDER BY id")
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Instrument {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    name: row.get(2)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn fetch_prices(
        &self,
        instrument_id: InstrumentId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT p.instrument_id, i.symbol, p.date, p.open, p.high, p.low, p.close, p.volume
                 FROM prices p JOIN instruments i ON i.id = p.instrument_id
                 WHERE p.instrument_id = ?1 AND p.date >= ?2 AND p.date <= ?3
                 ORDER BY p.date ASC",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(
                params![instrument_id, fmt_date(start_date), fmt_date(end_date)],
                bar_from_row,
            )
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn fetch_recent(
        &self,
        instrument_id: InstrumentId,
        limit: usize,
    ) -> Result<Vec<OhlcvBar>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT p.instrument_id, i.symbol, p.date, p.open, p.high, p.low, p.close, p.volume
                 FROM prices p JOIN instruments i ON i.id = p.instrument_id
                 WHERE p.instrument_id = ?1
                 ORDER BY p.date DESC LIMIT ?2",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![instrument_id, limit as i64], bar_from_row)
            .map_err(query_err)?;
        let mut bars = rows.collect::<Result<Vec<_>, _>>().map_err(query_err)?;
        bars.reverse();
        Ok(bars)
    }
}

impl AccountRepository for SqliteAdapter {
    fn create_account(
        &self,
        name: &str,
        initial_balance: f64,
        at: NaiveDateTime,
    ) -> Result<Account, PapertraderError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (name, initial_balance, current_balance, created_at, updated_at)
             VALUES (?1, ?2, ?2, ?3, ?3)",
            params![name, initial_balance, fmt_datetime(at)],
        )
        .map_err(query_err)?;
        Ok(Account::new(conn.last_insert_rowid(), name, initial_balance, at))
    }

    fn get_account(&self, account_id: AccountId) -> Result<Option<Account>, PapertraderError> {
        load_account(&*self.conn()?, account_id)
    }

    fn list_accounts(&self) -> Result<Vec<Account>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS))
            .map_err(query_err)?;
        let rows = stmt.query_map([], account_from_row).map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn get_position(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
    ) -> Result<Option<Position>, PapertraderError> {
        load_position(&*self.conn()?, account_id, instrument_id)
    }

    fn list_positions(&self, account_id: AccountId) -> Result<Vec<Position>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM positions WHERE account_id = ?1 ORDER BY instrument_id",
                POSITION_COLUMNS
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![account_id], position_from_row)
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn list_trades(
        &self,
        account_id: AccountId,
        limit: usize,
    ) -> Result<Vec<Trade>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, account_id, {} FROM trades WHERE account_id = ?1
                 ORDER BY id DESC LIMIT ?2",
                TRADE_COLUMNS
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], trade_from_row)
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    fn execute_atomic(
        &self,
        account_id: AccountId,
        instrument_id: InstrumentId,
        plan: &mut PlanFn<'_>,
    ) -> Result<Trade, PapertraderError> {
        let mut conn = self.conn()?;
        // IMMEDIATE takes the database write lock before the reads, so the
        // planned state is still current at commit.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;

        let account = load_account(&tx, account_id)?
            .ok_or(PapertraderError::AccountNotFound { account_id })?;
        let position = load_position(&tx, account_id, instrument_id)?;

        let execution = plan(&account, position.as_ref())?;
        let trade = write_execution(&tx, &execution)?;
        tx.commit().map_err(query_err)?;
        Ok(trade)
    }

    fn save_marks(
        &self,
        account_id: AccountId,
        prices: &HashMap<InstrumentId, f64>,
        at: NaiveDateTime,
    ) -> Result<usize, PapertraderError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        let mut updated = 0;
        for (instrument_id, price) in prices {
            updated += tx
                .execute(
                    "UPDATE positions SET current_price = ?1, updated_at = ?2
                     WHERE account_id = ?3 AND instrument_id = ?4",
                    params![price, fmt_datetime(at), account_id, instrument_id],
                )
                .map_err(query_err)?;
        }
        tx.commit().map_err(query_err)?;
        Ok(updated)
    }
}

impl ScoreRepository for SqliteAdapter {
    fn save_score(&self, s: &ScoreSnapshot) -> Result<i64, PapertraderError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO score_snapshots (instrument_id, symbol, date, rsi_score, macd_score,
                 bollinger_score, ema_score, prediction_score, total_score, signal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                s.instrument_id,
                s.symbol,
                fmt_date(s.date),
                s.rsi_score,
                s.macd_score,
                s.bollinger_score,
                s.ema_score,
                s.prediction_score,
                s.total_score,
                s.signal.to_string()
            ],
        )
        .map_err(query_err)?;
        Ok(conn.last_insert_rowid())
    }

    fn latest_scores(&self, limit: usize) -> Result<Vec<ScoreSnapshot>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM score_snapshots
                 WHERE id IN (SELECT MAX(id) FROM score_snapshots GROUP BY instrument_id)
                 ORDER BY total_score DESC, instrument_id ASC LIMIT ?1",
                SCORE_COLUMNS
            ))
            .map_err(query_err)?;
        let rows = stmt
            .query_map(params![limit as i64], score_from_row)
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }
}

impl BacktestRepository for SqliteAdapter {
    fn save_backtest(&self, result: &BacktestResult) -> Result<i64, PapertraderError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_err)?;
        let p = &result.params;

        tx.execute(
            "INSERT INTO backtest_results (strategy_name, start_date, end_date, initial_balance,
                 buy_threshold, sell_threshold, max_positions, budget_ratio, mark_fallback,
                 final_balance, total_return, sharpe_ratio, max_drawdown, win_rate, total_trades,
                 win_trades, stale_marks, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                p.strategy_name,
                fmt_date(p.start_date),
                fmt_date(p.end_date),
                p.initial_balance,
                p.buy_threshold,
                p.sell_threshold,
                p.max_positions as i64,
                p.budget_ratio,
                p.mark_fallback.to_string(),
                result.final_balance,
                result.total_return,
                result.sharpe_ratio,
                result.max_drawdown,
                result.win_rate,
                result.total_trades as i64,
                result.win_trades as i64,
                result.stale_marks as i64,
                fmt_datetime(result.created_at)
            ],
        )
        .map_err(query_err)?;
        let id = tx.last_insert_rowid();

        for (seq, t) in result.trades.iter().enumerate() {
            tx.execute(
                &format!(
                    "INSERT INTO backtest_trades (backtest_id, seq, {})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    TRADE_COLUMNS
                ),
                params![
                    id,
                    seq as i64,
                    t.instrument_id,
                    t.symbol,
                    t.side.to_string(),
                    t.quantity,
                    t.price,
                    t.total_amount,
                    t.commission,
                    t.tax,
                    t.realized_pnl,
                    fmt_datetime(t.executed_at)
                ],
            )
            .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        Ok(id)
    }

    fn get_backtest(&self, id: i64) -> Result<Option<BacktestResult>, PapertraderError> {
        let found = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {} FROM backtest_results WHERE id = ?1", BACKTEST_COLUMNS),
                params![id],
                backtest_from_row,
            )
            .optional()
            .map_err(query_err)?
        };

        match found {
            Some(mut result) => {
                result.trades = self.backtest_trades(id)?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    fn list_backtests(&self, limit: usize) -> Result<Vec<BacktestResult>, PapertraderError> {
        let mut results = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM backtest_results ORDER BY id DESC LIMIT ?1",
                    BACKTEST_COLUMNS
                ))
                .map_err(query_err)?;
            let rows = stmt
                .query_map(params![limit as i64], backtest_from_row)
                .map_err(query_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(query_err)?
        };

        for result in &mut results {
            if let Some(id) = result.id {
                result.trades = self.backtest_trades(id)?;
            }
        }
        Ok(results)
    }
}

impl RuleRepository for SqliteAdapter {
    fn create_rule(
        &self,
        settings: &RuleSettings,
        at: NaiveDateTime,
    ) -> Result<AutoTradingRule, PapertraderError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO auto_trading_rules (name, strategy_type, account_id, buy_score_threshold,
                 max_position_count, budget_ratio, schedule_buy, schedule_sell, is_active,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
            params![
                settings.name,
                settings.strategy_type,
                settings.account_id,
                settings.buy_score_threshold,
                settings.max_position_count as i64,
                settings.budget_ratio,
                settings.schedule_buy,
                settings.schedule_sell,
                fmt_datetime(at)
            ],
        )
        .map_err(query_err)?;
        Ok(AutoTradingRule::new(conn.last_insert_rowid(), settings.clone(), at))
    }

    fn get_rule(&self, rule_id: RuleId) -> Result<Option<AutoTradingRule>, PapertraderError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM auto_trading_rules WHERE id = ?1", RULE_COLUMNS),
            params![rule_id],
            rule_from_row,
        )
        .optional()
        .map_err(query_err)
    }

    fn list_rules(&self) -> Result<Vec<AutoTradingRule>, PapertraderError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM auto_trading_rules ORDER BY id", RULE_COLUMNS))
            .map_err(query_err)?;
        let rows = stmt.query_map([], rule_from_row).map_err(query_err)?;
        let rules = rows.collect::<Result<Vec<_>, _>>().map_err(query_err)?;
        Ok(rules)
    }

    fn save_rule(&self, rule: &AutoTradingRule) -> Result<(), PapertraderError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE auto_trading_rules SET name = ?1, strategy_type = ?2, account_id = ?3,
                     buy_score_threshold = ?4, max_position_count = ?5, budget_ratio = ?6,
                     schedule_buy = ?7, schedule_sell = ?8, is_active = ?9,
                     last_executed_at = ?10, updated_at = ?11
                 WHERE id = ?12",
                params![
                    rule.name,
                    rule.strategy_type,
                    rule.account_id,
                    rule.buy_score_threshold,
                    rule.max_position_count as i64,
                    rule.budget_ratio,
                    rule.schedule_buy,
                    rule.schedule_sell,
                    rule.is_active,
                    rule.last_executed_at.map(fmt_datetime),
                    fmt_datetime(rule.updated_at),
                    rule.id
                ],
            )
            .map_err(query_err)?;
        if updated == 0 {
            return Err(PapertraderError::RuleNotFound { rule_id: rule.id });
        }
        Ok(())
    }

    fn delete_rule(&self, rule_id: RuleId) -> Result<bool, PapertraderError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM auto_trading_rules WHERE id = ?1", params![rule_id])
            .map_err(query_err)?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::EquityPoint;
    use crate::domain::ledger::{plan_buy, plan_sell, FeeSchedule, Order};
    use tempfile::TempDir;

    struct EmptyConfig;

    impl ConfigPort for EmptyConfig {
        fn get_string(&self, _section: &str, _key: &str) -> Option<String> {
            None
        }
        fn get_int(&self, _section: &str, _key: &str, default: i64) -> i64 {
            default
        }
        fn get_double(&self, _section: &str, _key: &str, default: f64) -> f64 {
            default
        }
        fn get_bool(&self, _section: &str, _key: &str, default: bool) -> bool {
            default
        }
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at() -> NaiveDateTime {
        d("2024-03-04").and_hms_milli_opt(9, 30, 0, 250).unwrap()
    }

    fn bar(instrument: &Instrument, date: &str, close: f64) -> OhlcvBar {
        OhlcvBar {
            instrument_id: instrument.id,
            symbol: instrument.symbol.clone(),
            date: d(date),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000,
        }
    }

    #[test]
    fn from_config_missing_path() {
        match SqliteAdapter::from_config(&EmptyConfig) {
            Err(PapertraderError::ConfigMissing { section, key }) => {
                assert_eq!(section, "database");
                assert_eq!(key, "path");
            }
            Err(other) => panic!("expected ConfigMissing, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        adapter.initialize_schema().unwrap();
    }

    #[test]
    fn file_database_persists_between_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paper.db");
        let path = path.to_str().unwrap();
        {
            let adapter = SqliteAdapter::open(path, 2).unwrap();
            adapter.create_account("kept", 5_000.0, at()).unwrap();
        }
        let adapter = SqliteAdapter::open(path, 2).unwrap();
        let accounts = adapter.list_accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "kept");
        assert_eq!(accounts[0].created_at, at());
    }

    #[test]
    fn instruments_and_prices() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let a = adapter.upsert_instrument("005930", "Samsung Electronics").unwrap();
        let again = adapter.upsert_instrument("005930", "ignored").unwrap();
        assert_eq!(a, again);
        let b = adapter.upsert_instrument("000660", "SK hynix").unwrap();

        adapter
            .insert_bars(&[
                bar(&a, "2024-01-03", 102.0),
                bar(&a, "2024-01-02", 101.0),
                bar(&a, "2024-01-04", 103.0),
                bar(&b, "2024-01-02", 50.0),
            ])
            .unwrap();
        adapter.insert_bars(&[bar(&a, "2024-01-04", 104.0)]).unwrap();

        let instruments = adapter.list_instruments().unwrap();
        assert_eq!(instruments.len(), 2);
        assert_eq!(instruments[0].name, "Samsung Electronics");

        let bars = adapter.fetch_prices(a.id, d("2024-01-02"), d("2024-01-03")).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 101.0);
        assert_eq!(bars[0].symbol, "005930");

        let recent = adapter.fetch_recent(a.id, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].date, d("2024-01-03"));
        assert_eq!(recent[1].close, 104.0);
    }

    fn buy(
        symbol: &'static str,
        quantity: i64,
        price: f64,
    ) -> impl Fn(&Account, Option<&Position>) -> Result<Execution, PapertraderError> {
        move |account, existing| {
            let order = Order::new(1, symbol, quantity, price);
            plan_buy(account, existing, &order, &FeeSchedule::default(), at())
        }
    }

    #[test]
    fn execute_atomic_round_trip() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let account = adapter.create_account("paper", 10_000_000.0, at()).unwrap();

        let trade = adapter
            .execute_atomic(account.id, 1, &mut buy("005930", 10, 1000.0))
            .unwrap();
        assert!(trade.id.is_some());

        let stored = adapter.get_account(account.id).unwrap().unwrap();
        assert_eq!(stored.current_balance, 9_989_998.5);
        let position = adapter.get_position(account.id, 1).unwrap().unwrap();
        assert_eq!(position.quantity, 10);
        assert_eq!(position.avg_price, 1000.0);

        let mut sell = |account: &Account, existing: Option<&Position>| {
            plan_sell(
                account,
                existing,
                &Order::new(1, "005930", 10, 1100.0),
                TradeSide::Sell,
                &FeeSchedule::default(),
                at(),
            )
        };
        adapter.execute_atomic(account.id, 1, &mut sell).unwrap();

        assert!(adapter.get_position(account.id, 1).unwrap().is_none());
        let stored = adapter.get_account(account.id).unwrap().unwrap();
        assert_eq!(stored.total_trades, 1);
        assert_eq!(stored.win_trades, 1);

        let trades = adapter.list_trades(account.id, 10).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert!(trades[0].realized_pnl.is_some());
        assert_eq!(trades[1].side, TradeSide::Buy);
        assert_eq!(trades[1].realized_pnl, None);
        assert_eq!(trades[1].executed_at, at());
    }

    #[test]
    fn execute_atomic_for_missing_account_writes_nothing() {
        let adapter = SqliteAdapter::in_memory().unwrap();

        assert!(matches!(
            adapter.execute_atomic(77, 1, &mut buy("A", 1, 10.0)),
            Err(PapertraderError::AccountNotFound { account_id: 77 })
        ));
        assert!(adapter.list_positions(77).unwrap().is_empty());
        assert!(adapter.list_trades(77, 10).unwrap().is_empty());
    }

    #[test]
    fn rejected_plan_rolls_back() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let account = adapter.create_account("small", 100.0, at()).unwrap();

        assert!(matches!(
            adapter.execute_atomic(account.id, 1, &mut buy("A", 10, 100.0)),
            Err(PapertraderError::InsufficientFunds { .. })
        ));
        assert_eq!(adapter.get_account(account.id).unwrap().unwrap(), account);
        assert!(adapter.list_trades(account.id, 10).unwrap().is_empty());
        // The connection is usable again after the rollback.
        adapter.execute_atomic(account.id, 1, &mut buy("A", 1, 10.0)).unwrap();
    }

    #[test]
    fn separate_handles_on_one_file_never_lose_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let path = path.to_str().unwrap();
        let first = std::sync::Arc::new(SqliteAdapter::open(path, 4).unwrap());
        let second = std::sync::Arc::new(SqliteAdapter::open(path, 4).unwrap());
        let account_id = first.create_account("shared", 1_000_000.0, at()).unwrap().id;

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let adapter = if i % 2 == 0 { first.clone() } else { second.clone() };
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        adapter
                            .execute_atomic(account_id, 1, &mut buy("A", 1, 1000.0))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stored = second.get_account(account_id).unwrap().unwrap();
        assert!((stored.current_balance - (1_000_000.0 - 80.0 * 1000.15)).abs() < 1e-6);
        assert_eq!(second.get_position(account_id, 1).unwrap().unwrap().quantity, 80);
        assert_eq!(first.list_trades(account_id, 1000).unwrap().len(), 80);
    }

    #[test]
    fn save_marks_updates_only_held() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let account = adapter.create_account("paper", 100_000.0, at()).unwrap();
        adapter.execute_atomic(account.id, 1, &mut buy("A", 5, 100.0)).unwrap();

        let prices = HashMap::from([(1, 120.0), (2, 50.0)]);
        assert_eq!(adapter.save_marks(account.id, &prices, at()).unwrap(), 1);
        let position = adapter.get_position(account.id, 1).unwrap().unwrap();
        assert_eq!(position.current_price, Some(120.0));
    }

    #[test]
    fn latest_scores_newest_per_instrument() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let snap = |id: i64, total: f64, signal: Signal| ScoreSnapshot {
            id: None,
            instrument_id: id,
            symbol: format!("S{}", id),
            date: d("2024-03-04"),
            rsi_score: 50.0,
            macd_score: 50.0,
            bollinger_score: 50.0,
            ema_score: 50.0,
            prediction_score: 50.0,
            total_score: total,
            signal,
        };

        adapter.save_score(&snap(1, 75.0, Signal::Buy)).unwrap();
        adapter.save_score(&snap(2, 20.0, Signal::Sell)).unwrap();
        adapter.save_score(&snap(1, 55.5, Signal::Hold)).unwrap();

        let latest = adapter.latest_scores(10).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].instrument_id, 1);
        assert_eq!(latest[0].total_score, 55.5);
        assert_eq!(latest[0].signal, Signal::Hold);
        assert_eq!(latest[1].signal, Signal::Sell);
        assert_eq!(adapter.latest_scores(1).unwrap().len(), 1);
    }

    #[test]
    fn backtest_results_round_trip_without_curve() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let mut params =
            BacktestParams::new("scoring", d("2024-01-02"), d("2024-03-29"), 1_000_000.0);
        params.mark_fallback = MarkFallback::LastKnown;
        let trade = Trade {
            id: None,
            account_id: 0,
            instrument_id: 3,
            symbol: "S3".into(),
            side: TradeSide::SellClose,
            quantity: 4,
            price: 250.0,
            total_amount: 1000.0,
            commission: 0.15,
            tax: 2.3,
            realized_pnl: Some(-12.45),
            executed_at: d("2024-03-29").and_hms_opt(0, 0, 0).unwrap(),
        };
        let result = BacktestResult {
            id: None,
            params,
            final_balance: 998_765.0,
            total_return: -0.12,
            sharpe_ratio: -0.4321,
            max_drawdown: -1.5,
            win_rate: 0.0,
            total_trades: 1,
            win_trades: 0,
            stale_marks: 2,
            trades: vec![trade],
            equity_curve: vec![EquityPoint {
                date: d("2024-01-02"),
                value: 1_000_000.0,
                stale: false,
            }],
            created_at: at(),
        };

        let first = adapter.save_backtest(&result).unwrap();
        let second = adapter.save_backtest(&result).unwrap();
        assert!(second > first);

        let loaded = adapter.get_backtest(first).unwrap().unwrap();
        assert_eq!(loaded.id, Some(first));
        assert_eq!(loaded.params, result.params);
        assert_eq!(loaded.trades, result.trades);
        assert!(loaded.equity_curve.is_empty());
        assert_eq!(loaded.stale_marks, 2);

        let listed = adapter.list_backtests(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, Some(second));
        assert!(adapter.get_backtest(999).unwrap().is_none());
    }

    #[test]
    fn rules_persist_and_update() {
        let adapter = SqliteAdapter::in_memory().unwrap();
        let mut settings = RuleSettings::new("weekday", 4);
        settings.schedule_sell = Some("0 14 * * 1-5".into());
        let rule = adapter.create_rule(&settings, at()).unwrap();

        let loaded = adapter.get_rule(rule.id).unwrap().unwrap();
        assert_eq!(loaded, rule);
        assert_eq!(loaded.schedule_buy, None);
        assert_eq!(loaded.sell_schedule(), "0 14 * * 1-5");

        let mut changed = loaded.clone();
        changed.is_active = false;
        changed.buy_score_threshold = 75.5;
        changed.last_executed_at = Some(at());
        adapter.save_rule(&changed).unwrap();
        assert_eq!(adapter.get_rule(rule.id).unwrap().unwrap(), changed);
        assert_eq!(adapter.list_rules().unwrap(), vec![changed.clone()]);

        assert!(adapter.delete_rule(rule.id).unwrap());
        assert!(!adapter.delete_rule(rule.id).unwrap());
        assert!(adapter.get_rule(rule.id).unwrap().is_none());
        assert!(matches!(
            adapter.save_rule(&changed),
            Err(PapertraderError::RuleNotFound { .. })
        ));
    }
}
