//! CLI definition and dispatch.

use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::adapters::csv_adapter::{self, CsvAdapter};
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::memory_adapter::MemoryStore;
use crate::adapters::prediction_adapter::{FixedPredictions, NeutralPredictor};
use crate::domain::account::{Account, AccountId};
use crate::domain::auto_trading::{AutoTradingRule, RuleId, RuleSettings, RuleUpdate};
use crate::domain::backtest::BacktestResult;
use crate::domain::config_validation::{
    data_source, fee_schedule, load_backtest_params, lookback_bars, pool_size,
    validate_backtest_config, warmup_days, DataSource,
};
use crate::domain::error::PapertraderError;
use crate::domain::ohlcv::Instrument;
use crate::domain::scoring::ScoreSnapshot;
use crate::logging;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::MarketDataPort;
use crate::ports::prediction_port::PredictionPort;
use crate::ports::repository_port::{
    AccountRepository, BacktestRepository, RuleRepository, ScoreRepository,
};
use crate::services::auto_trading_service::{AutoTrader, Round, RoundReport};
use crate::services::backtest_service::BacktestEngine;
use crate::services::scoring_service::ScoringEngine;
use crate::services::trading_service::TradingEngine;

#[cfg(feature = "sqlite")]
use crate::adapters::sqlite_adapter::SqliteAdapter;

#[derive(Parser, Debug)]
#[command(name = "papertrader", about = "Paper trading and strategy backtesting")]
pub struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backtest over the configured date range
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Write the trade log as CSV
        #[arg(long)]
        trades_out: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Score every instrument, or show the latest stored scores
    Score {
        #[arg(short, long)]
        config: PathBuf,
        /// Show the newest stored snapshots instead of scoring
        #[arg(long)]
        latest: Option<usize>,
    },
    /// Load a date,open,high,low,close,volume CSV into the database
    ImportPrices {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Manage paper accounts
    Account {
        #[arg(short, long)]
        config: PathBuf,
        #[command(subcommand)]
        action: AccountCommand,
    },
    /// Buy at a given price
    Buy {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        quantity: i64,
        #[arg(long)]
        price: f64,
    },
    /// Sell at a given price
    Sell {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        quantity: i64,
        #[arg(long)]
        price: f64,
    },
    /// Show open positions
    Positions {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        account: AccountId,
    },
    /// Re-mark open positions at their latest close
    Mark {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        account: AccountId,
    },
    /// Show recent trades, newest first
    Trades {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        account: AccountId,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Manage automated-trading rules
    Rule {
        #[arg(short, long)]
        config: PathBuf,
        #[command(subcommand)]
        action: RuleCommand,
    },
    /// Run one automated-trading round for a rule, or for every active rule
    AutoTrade {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(value_enum)]
        round: RoundArg,
        #[arg(long)]
        rule: Option<RuleId>,
    },
    /// Show stored backtest results
    Results {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        id: Option<i64>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        balance: Option<f64>,
    },
    List,
    Show {
        #[arg(long)]
        id: AccountId,
    },
}

#[derive(Subcommand, Debug)]
pub enum RuleCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        account: AccountId,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        buy_threshold: Option<f64>,
        #[arg(long)]
        max_positions: Option<usize>,
        #[arg(long)]
        budget_ratio: Option<f64>,
        /// Five-field cron expression
        #[arg(long)]
        schedule_buy: Option<String>,
        #[arg(long)]
        schedule_sell: Option<String>,
    },
    List,
    Update {
        #[arg(long)]
        id: RuleId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        buy_threshold: Option<f64>,
        #[arg(long)]
        max_positions: Option<usize>,
        #[arg(long)]
        budget_ratio: Option<f64>,
        #[arg(long)]
        schedule_buy: Option<String>,
        #[arg(long)]
        schedule_sell: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
    Delete {
        #[arg(long)]
        id: RuleId,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum RoundArg {
    Buy,
    Sell,
}

impl From<RoundArg> for Round {
    fn from(arg: RoundArg) -> Self {
        match arg {
            RoundArg::Buy => Round::Buy,
            RoundArg::Sell => Round::Sell,
        }
    }
}

pub fn run(cli: Cli) -> ExitCode {
    logging::init(cli.verbose);

    match cli.command {
        Command::Backtest { config, trades_out } => run_backtest(&config, trades_out.as_deref()),
        Command::Validate { config } => run_validate(&config),
        Command::Score { config, latest } => run_score(&config, latest),
        Command::ImportPrices {
            config,
            symbol,
            file,
            name,
        } => run_import_prices(&config, &symbol, &file, name.as_deref()),
        Command::Account { config, action } => run_account(&config, action),
        Command::Buy {
            config,
            account,
            symbol,
            quantity,
            price,
        } => run_order(&config, OrderSide::Buy, account, &symbol, quantity, price),
        Command::Sell {
            config,
            account,
            symbol,
            quantity,
            price,
        } => run_order(&config, OrderSide::Sell, account, &symbol, quantity, price),
        Command::Positions { config, account } => run_positions(&config, account),
        Command::Mark { config, account } => run_mark(&config, account),
        Command::Trades {
            config,
            account,
            limit,
        } => run_trades(&config, account, limit),
        Command::Rule { config, action } => run_rule(&config, action),
        Command::AutoTrade {
            config,
            round,
            rule,
        } => run_auto_trade(&config, round.into(), rule),
        Command::Results { config, id, limit } => run_results(&config, id, limit),
    }
}

fn fail(err: &PapertraderError) -> ExitCode {
    eprintln!("error: {err}");
    err.into()
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| fail(&e))
}

/// Adapters behind every port, resolved from `[database]`/`[data]`.
pub struct Stores {
    pub market: Arc<dyn MarketDataPort>,
    pub accounts: Arc<dyn AccountRepository>,
    pub scores: Arc<dyn ScoreRepository>,
    pub backtests: Arc<dyn BacktestRepository>,
    pub rules: Arc<dyn RuleRepository>,
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &dyn ConfigPort, path: &str) -> Result<Arc<SqliteAdapter>, PapertraderError> {
    Ok(Arc::new(SqliteAdapter::open(path, pool_size(config)?)?))
}

#[cfg(feature = "sqlite")]
fn open_database(config: &dyn ConfigPort, path: &str) -> Result<Stores, PapertraderError> {
    let db = open_sqlite(config, path)?;
    Ok(Stores {
        market: db.clone(),
        accounts: db.clone(),
        scores: db.clone(),
        backtests: db.clone(),
        rules: db,
    })
}

#[cfg(not(feature = "sqlite"))]
fn open_database(config: &dyn ConfigPort, _path: &str) -> Result<Stores, PapertraderError> {
    pool_size(config)?;
    Err(PapertraderError::ConfigInvalid {
        section: "database".into(),
        key: "path".into(),
        reason: "built without sqlite support".into(),
    })
}

/// `durable` commands need a database; a CSV price directory alone only
/// backs in-memory repositories that vanish on exit.
pub fn open_stores(config: &dyn ConfigPort, durable: bool) -> Result<Stores, PapertraderError> {
    match data_source(config)? {
        DataSource::Database(path) => open_database(config, &path),
        DataSource::CsvDir(_) if durable => Err(PapertraderError::ConfigMissing {
            section: "database".into(),
            key: "path".into(),
        }),
        DataSource::CsvDir(dir) => {
            let memory = Arc::new(MemoryStore::new());
            tracing::debug!(%dir, "reading prices from CSV, results are not persisted");
            Ok(Stores {
                market: Arc::new(CsvAdapter::new(PathBuf::from(dir))),
                accounts: memory.clone(),
                scores: memory.clone(),
                backtests: memory.clone(),
                rules: memory,
            })
        }
    }
}

pub fn open_predictor(config: &dyn ConfigPort) -> Result<Arc<dyn PredictionPort>, PapertraderError> {
    match config
        .get_string("data", "predictions")
        .filter(|s| !s.trim().is_empty())
    {
        Some(path) => {
            let predictions = FixedPredictions::from_csv(Path::new(path.trim()))?;
            eprintln!("Loaded {} predictions from {}", predictions.len(), path.trim());
            Ok(Arc::new(predictions))
        }
        None => Ok(Arc::new(NeutralPredictor)),
    }
}

fn run_backtest(config_path: &Path, trades_out: Option<&Path>) -> ExitCode {
    // Stage 1: Load and validate config
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    if let Err(e) = validate_backtest_config(&adapter) {
        return fail(&e);
    }

    match backtest_pipeline(&adapter, trades_out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

fn backtest_pipeline(adapter: &dyn ConfigPort, trades_out: Option<&Path>) -> Result<(), PapertraderError> {
    // Stage 2: Typed parameters
    let params = load_backtest_params(adapter)?;
    let fees = fee_schedule(adapter)?;
    let warmup = warmup_days(adapter)?;

    // Stage 3: Wire adapters
    let stores = open_stores(adapter, false)?;
    let predictor = open_predictor(adapter)?;
    let engine = BacktestEngine::new(stores.market, predictor, stores.backtests)
        .with_fees(fees)
        .with_warmup_days(warmup);

    // Stage 4: Run
    eprintln!(
        "Running '{}' from {} to {}...",
        params.strategy_name, params.start_date, params.end_date
    );
    let result = engine.run_backtest(&params)?;
    print_result(&result);

    // Stage 5: Trade log
    if let Some(path) = trades_out {
        csv_adapter::write_trade_log(path, &result.trades)?;
        eprintln!("\nTrade log written to: {}", path.display());
    }
    Ok(())
}

fn print_result(result: &BacktestResult) {
    let p = &result.params;
    println!("=== Backtest #{} ===", result.id.unwrap_or_default());
    println!("Strategy:         {}", p.strategy_name);
    println!("Period:           {} .. {}", p.start_date, p.end_date);
    println!(
        "Thresholds:       buy >= {:.2}, sell <= {:.2}",
        p.buy_threshold, p.sell_threshold
    );
    println!(
        "Sizing:           {} positions, {:.0}% of cash per round",
        p.max_positions,
        p.budget_ratio * 100.0
    );
    println!("Initial Balance:  {:.0}", p.initial_balance);
    println!("Final Balance:    {:.0}", result.final_balance);
    println!("Total Return:     {:.2}%", result.total_return);
    println!("Sharpe Ratio:     {:.4}", result.sharpe_ratio);
    println!("Max Drawdown:     {:.2}%", result.max_drawdown);
    println!(
        "Trades:           {} ({} winning, {:.2}%)",
        result.total_trades, result.win_trades, result.win_rate
    );
    if result.stale_marks > 0 {
        println!(
            "Stale Marks:      {} ({} fallback)",
            result.stale_marks, p.mark_fallback
        );
    }
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let checks = validate_backtest_config(&adapter)
        .and_then(|_| lookback_bars(&adapter).map(|_| ()))
        .and_then(|_| pool_size(&adapter).map(|_| ()));
    if let Err(e) = checks {
        return fail(&e);
    }

    match load_backtest_params(&adapter) {
        Ok(params) => {
            eprintln!("Config validated successfully");
            eprintln!(
                "  {}: {} .. {}, balance {:.0}, mark fallback {}",
                params.strategy_name,
                params.start_date,
                params.end_date,
                params.initial_balance,
                params.mark_fallback
            );
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn print_scores(scores: &[ScoreSnapshot]) {
    println!(
        "{:<10} {:<10} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7}  SIGNAL",
        "SYMBOL", "DATE", "RSI", "MACD", "BOLL", "EMA", "PRED", "TOTAL"
    );
    for s in scores {
        println!(
            "{:<10} {:<10} {:>7.2} {:>7.2} {:>7.2} {:>7.2} {:>7.2} {:>7.2}  {}",
            s.symbol,
            s.date,
            s.rsi_score,
            s.macd_score,
            s.bollinger_score,
            s.ema_score,
            s.prediction_score,
            s.total_score,
            s.signal
        );
    }
}

fn run_score(config_path: &Path, latest: Option<usize>) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let result = (|| -> Result<Vec<ScoreSnapshot>, PapertraderError> {
        let stores = open_stores(&adapter, latest.is_some())?;
        let predictor = open_predictor(&adapter)?;
        let engine = ScoringEngine::new(stores.market, predictor, stores.scores)
            .with_lookback_bars(lookback_bars(&adapter)?);
        match latest {
            Some(limit) => engine.latest_scores(limit),
            None => engine.score_all(),
        }
    })();

    match result {
        Ok(scores) if scores.is_empty() => {
            eprintln!("No instruments could be scored");
            ExitCode::SUCCESS
        }
        Ok(scores) => {
            print_scores(&scores);
            eprintln!("{} instruments", scores.len());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

#[cfg(feature = "sqlite")]
fn run_import_prices(config_path: &Path, symbol: &str, file: &Path, name: Option<&str>) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let result = (|| -> Result<usize, PapertraderError> {
        let path = match data_source(&adapter)? {
            DataSource::Database(path) => path,
            DataSource::CsvDir(_) => {
                return Err(PapertraderError::ConfigMissing {
                    section: "database".into(),
                    key: "path".into(),
                });
            }
        };
        let db = open_sqlite(&adapter, &path)?;
        let instrument = db.upsert_instrument(symbol, name.unwrap_or(symbol))?;
        let bars = csv_adapter::read_bars_file(file, &instrument)?;
        db.insert_bars(&bars)
    })();

    match result {
        Ok(count) => {
            eprintln!("Imported {} bars for {}", count, symbol);
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

#[cfg(not(feature = "sqlite"))]
fn run_import_prices(_config_path: &Path, _symbol: &str, _file: &Path, _name: Option<&str>) -> ExitCode {
    eprintln!("error: sqlite feature is required for import-prices");
    ExitCode::from(1)
}

fn open_trading(config_path: &Path) -> Result<(TradingEngine, Stores), ExitCode> {
    let adapter = load_config(config_path)?;
    let stores = open_stores(&adapter, true).map_err(|e| fail(&e))?;
    let fees = fee_schedule(&adapter).map_err(|e| fail(&e))?;
    Ok((TradingEngine::with_fees(stores.accounts.clone(), fees), stores))
}

fn print_account(account: &Account) {
    println!(
        "#{:<4} {:<20} cash {:>16.2}  P&L {:>14.2}  trades {:>4}  win {:>6.2}%",
        account.id,
        account.name,
        account.current_balance,
        account.total_profit_loss,
        account.total_trades,
        account.win_rate()
    );
}

fn run_account(config_path: &Path, action: AccountCommand) -> ExitCode {
    let (engine, _stores) = match open_trading(config_path) {
        Ok(t) => t,
        Err(code) => return code,
    };

    match action {
        AccountCommand::Create { name, balance } => match engine.create_account(&name, balance) {
            Ok(account) => {
                print_account(&account);
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },
        AccountCommand::List => match engine.list_accounts() {
            Ok(accounts) => {
                for account in &accounts {
                    print_account(account);
                }
                eprintln!("{} accounts", accounts.len());
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },
        AccountCommand::Show { id } => match engine.get_account_summary(id) {
            Ok(s) => {
                println!("Account #{} ({})", s.account_id, s.name);
                println!("Initial Balance:  {:.2}", s.initial_balance);
                println!("Cash:             {:.2}", s.current_balance);
                println!("Position Value:   {:.2}", s.total_position_value);
                println!("Total Assets:     {:.2}", s.total_assets);
                println!("Total Return:     {:.2}%", s.total_return_rate);
                println!("Realized P&L:     {:.2}", s.total_profit_loss);
                println!(
                    "Trades:           {} ({} winning, {:.2}%)",
                    s.total_trades, s.win_trades, s.win_rate
                );
                println!("Open Positions:   {}", s.positions);
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },
    }
}

#[derive(Debug, Clone, Copy)]
enum OrderSide {
    Buy,
    Sell,
}

fn find_instrument(market: &dyn MarketDataPort, symbol: &str) -> Result<Instrument, PapertraderError> {
    market
        .list_instruments()?
        .into_iter()
        .find(|i| i.symbol == symbol)
        .ok_or_else(|| PapertraderError::invalid(format!("unknown symbol '{}'", symbol)))
}

fn run_order(
    config_path: &Path,
    side: OrderSide,
    account_id: AccountId,
    symbol: &str,
    quantity: i64,
    price: f64,
) -> ExitCode {
    let (engine, stores) = match open_trading(config_path) {
        Ok(t) => t,
        Err(code) => return code,
    };

    let result = find_instrument(stores.market.as_ref(), symbol).and_then(|instrument| match side {
        OrderSide::Buy => engine.buy(account_id, instrument.id, &instrument.symbol, quantity, price),
        OrderSide::Sell => engine.sell(account_id, instrument.id, &instrument.symbol, quantity, price),
    });

    match result {
        Ok(outcome) if outcome.success => {
            println!("{}", outcome.message);
            if let Some(trade) = outcome.trade {
                println!(
                    "  total {:.2}, commission {:.2}, tax {:.2}",
                    trade.total_amount, trade.commission, trade.tax
                );
                if let Some(pnl) = trade.realized_pnl {
                    println!("  realized P&L {:.2}", pnl);
                }
            }
            ExitCode::SUCCESS
        }
        Ok(outcome) => {
            eprintln!("rejected: {}", outcome.message);
            ExitCode::from(6)
        }
        Err(e) => fail(&e),
    }
}

fn run_positions(config_path: &Path, account_id: AccountId) -> ExitCode {
    let (engine, _stores) = match open_trading(config_path) {
        Ok(t) => t,
        Err(code) => return code,
    };

    match engine.get_positions(account_id) {
        Ok(positions) => {
            println!(
                "{:<10} {:>10} {:>14} {:>14} {:>16}",
                "SYMBOL", "QTY", "AVG", "MARK", "UNREALIZED"
            );
            for p in &positions {
                println!(
                    "{:<10} {:>10} {:>14.2} {:>14.2} {:>16.2}",
                    p.symbol,
                    p.quantity,
                    p.avg_price,
                    p.mark_price(),
                    p.unrealized_pnl()
                );
            }
            eprintln!("{} positions", positions.len());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn run_mark(config_path: &Path, account_id: AccountId) -> ExitCode {
    let (engine, stores) = match open_trading(config_path) {
        Ok(t) => t,
        Err(code) => return code,
    };

    let result = engine.get_positions(account_id).and_then(|positions| {
        let mut prices = HashMap::new();
        for p in &positions {
            match stores.market.fetch_recent(p.instrument_id, 1) {
                Ok(bars) => {
                    if let Some(bar) = bars.last() {
                        prices.insert(p.instrument_id, bar.close);
                    }
                }
                Err(e) => eprintln!("warning: no price for {} ({})", p.symbol, e),
            }
        }
        engine.update_position_prices(account_id, &prices)
    });

    match result {
        Ok(updated) => {
            eprintln!("Re-marked {} positions", updated);
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn run_trades(config_path: &Path, account_id: AccountId, limit: usize) -> ExitCode {
    let (engine, _stores) = match open_trading(config_path) {
        Ok(t) => t,
        Err(code) => return code,
    };

    match engine.get_trades(account_id, limit) {
        Ok(trades) => {
            for t in &trades {
                let pnl = t
                    .realized_pnl
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {:<11} {:<10} {:>8} @ {:>12.2}  fees {:>10.2}  P&L {:>12}",
                    t.executed_at.format("%Y-%m-%d %H:%M:%S"),
                    t.side,
                    t.symbol,
                    t.quantity,
                    t.price,
                    t.commission + t.tax,
                    pnl
                );
            }
            eprintln!("{} trades", trades.len());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn open_auto_trader(config_path: &Path) -> Result<AutoTrader, ExitCode> {
    let adapter = load_config(config_path)?;
    let wire = || -> Result<AutoTrader, PapertraderError> {
        let stores = open_stores(&adapter, true)?;
        let predictor = open_predictor(&adapter)?;
        let scoring = ScoringEngine::new(stores.market.clone(), predictor, stores.scores)
            .with_lookback_bars(lookback_bars(&adapter)?);
        let trading = TradingEngine::with_fees(stores.accounts, fee_schedule(&adapter)?);
        Ok(AutoTrader::new(
            stores.rules,
            stores.market,
            Arc::new(scoring),
            Arc::new(trading),
        ))
    };
    wire().map_err(|e| fail(&e))
}

fn print_rule(rule: &AutoTradingRule) {
    let last = rule
        .last_executed_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "#{:<4} {:<16} account {:<4} {:<8} buy >= {:>6.2}  max {}  budget {:.0}%  [{}] / [{}]  last {}",
        rule.id,
        rule.name,
        rule.account_id,
        if rule.is_active { "active" } else { "inactive" },
        rule.buy_score_threshold,
        rule.max_position_count,
        rule.budget_ratio * 100.0,
        rule.buy_schedule(),
        rule.sell_schedule(),
        last
    );
}

fn run_rule(config_path: &Path, action: RuleCommand) -> ExitCode {
    let trader = match open_auto_trader(config_path) {
        Ok(t) => t,
        Err(code) => return code,
    };

    let result = match action {
        RuleCommand::Create {
            name,
            account,
            strategy,
            buy_threshold,
            max_positions,
            budget_ratio,
            schedule_buy,
            schedule_sell,
        } => {
            let mut settings = RuleSettings::new(name, account);
            if let Some(strategy) = strategy {
                settings.strategy_type = strategy;
            }
            if let Some(threshold) = buy_threshold {
                settings.buy_score_threshold = threshold;
            }
            if let Some(count) = max_positions {
                settings.max_position_count = count;
            }
            if let Some(ratio) = budget_ratio {
                settings.budget_ratio = ratio;
            }
            settings.schedule_buy = schedule_buy;
            settings.schedule_sell = schedule_sell;
            trader.create_rule(&settings).map(|rule| vec![rule])
        }
        RuleCommand::List => trader.list_rules(),
        RuleCommand::Update {
            id,
            name,
            strategy,
            buy_threshold,
            max_positions,
            budget_ratio,
            schedule_buy,
            schedule_sell,
            active,
        } => {
            let update = RuleUpdate {
                name,
                strategy_type: strategy,
                buy_score_threshold: buy_threshold,
                max_position_count: max_positions,
                budget_ratio,
                schedule_buy,
                schedule_sell,
                is_active: active,
            };
            if update.is_empty() {
                Err(PapertraderError::invalid("nothing to update"))
            } else {
                trader.update_rule(id, &update).map(|rule| vec![rule])
            }
        }
        RuleCommand::Delete { id } => trader.delete_rule(id).map(|()| {
            eprintln!("Deleted rule #{}", id);
            Vec::new()
        }),
    };

    match result {
        Ok(rules) => {
            for rule in &rules {
                print_rule(rule);
            }
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn print_round(report: &RoundReport) {
    println!("=== Rule #{} {} round ===", report.rule_id, report.round);
    for order in &report.orders {
        if order.success {
            println!("  {}", order.message);
        } else {
            println!("  rejected: {}", order.message);
        }
    }
    println!(
        "  {} of {} orders filled",
        report.filled().count(),
        report.orders.len()
    );
}

fn run_auto_trade(config_path: &Path, round: Round, rule: Option<RuleId>) -> ExitCode {
    let trader = match open_auto_trader(config_path) {
        Ok(t) => t,
        Err(code) => return code,
    };

    let result = match rule {
        Some(rule_id) => trader.execute(rule_id, round).map(|report| vec![report]),
        None => trader.run_active(round),
    };

    match result {
        Ok(reports) => {
            for report in &reports {
                print_round(report);
            }
            eprintln!("{} rules run", reports.len());
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn run_results(config_path: &Path, id: Option<i64>, limit: usize) -> ExitCode {
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let stores = match open_stores(&adapter, true) {
        Ok(s) => s,
        Err(e) => return fail(&e),
    };
    let engine = BacktestEngine::new(stores.market, Arc::new(NeutralPredictor), stores.backtests);

    match id {
        Some(id) => match engine.get_result(id) {
            Ok(Some(result)) => {
                print_result(&result);
                ExitCode::SUCCESS
            }
            Ok(None) => fail(&PapertraderError::no_data(format!("no backtest result #{}", id))),
            Err(e) => fail(&e),
        },
        None => match engine.list_results(limit) {
            Ok(results) => {
                for r in &results {
                    println!(
                        "#{:<4} {:<16} {} .. {}  return {:>8.2}%  sharpe {:>8.4}  mdd {:>7.2}%  trades {}",
                        r.id.unwrap_or_default(),
                        r.params.strategy_name,
                        r.params.start_date,
                        r.params.end_date,
                        r.total_return,
                        r.sharpe_ratio,
                        r.max_drawdown,
                        r.total_trades
                    );
                }
                eprintln!("{} results", results.len());
                ExitCode::SUCCESS
            }
            Err(e) => fail(&e),
        },
    }
}
