//! CLI integration tests: real INI files, CSV price directories and SQLite
//! databases on disk, driven through `cli::run`.
//!
//! Tests cover:
//! - Config validation and exit codes for bad configs
//! - Backtests over a CSV price directory, with and without predictions
//! - Store and predictor wiring (`open_stores`, `open_predictor`)
//! - Account commands against a database file
//! - Automated-trading rules and rounds against a database file

mod common;

use clap::Parser;
use common::*;
use papertrader::adapters::file_config_adapter::FileConfigAdapter;
use papertrader::cli::{self, Cli};
use papertrader::domain::error::PapertraderError;
use papertrader::ports::data_port::MarketDataPort;
use papertrader::ports::prediction_port::PredictionPort;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use tempfile::TempDir;

fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn write_prices(dir: &Path, symbol: &str, bars: &[OhlcvBar]) {
    let mut content = String::from("date,open,high,low,close,volume\n");
    for b in bars {
        content.push_str(&format!(
            "{},{},{},{},{},{}\n",
            b.date, b.open, b.high, b.low, b.close, b.volume
        ));
    }
    fs::write(dir.join(format!("{}.csv", symbol)), content).unwrap();
}

fn write_predictions(dir: &Path, symbol: &str) -> String {
    let path = dir.join("predictions.csv");
    fs::write(
        &path,
        format!("symbol,date,predicted_change\n{symbol},2024-03-01,50.0\n{symbol},2024-03-02,-50.0\n"),
    )
    .unwrap();
    path.to_str().unwrap().to_string()
}

fn csv_ini(prices_dir: &Path, predictions: Option<&str>) -> String {
    let predictions = predictions
        .map(|p| format!("predictions = {}\n", p))
        .unwrap_or_default();
    format!(
        r#"
[data]
prices_dir = {}
{}
[backtest]
strategy_name = dip
start_date = 2024-03-01
end_date = 2024-03-02
initial_balance = 1000000
"#,
        prices_dir.display(),
        predictions
    )
}

fn run(args: &[&str]) -> ExitCode {
    let mut argv = vec!["papertrader"];
    argv.extend_from_slice(args);
    cli::run(Cli::try_parse_from(argv).unwrap())
}

fn assert_exit(code: ExitCode, expected: u8) {
    let expected = if expected == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(expected)
    };
    assert_eq!(format!("{:?}", code), format!("{:?}", expected));
}

mod argument_parsing {
    use super::*;

    #[test]
    fn parses_account_subcommands() {
        let cli = Cli::try_parse_from([
            "papertrader", "-v", "account", "--config", "a.ini", "create", "--name", "main",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            cli::Command::Account {
                action: cli::AccountCommand::Create { ref name, balance: None },
                ..
            } if name == "main"
        ));
    }

    #[test]
    fn trades_limit_defaults_to_twenty() {
        let cli = Cli::try_parse_from(["papertrader", "trades", "-c", "a.ini", "--account", "3"])
            .unwrap();
        assert!(matches!(
            cli.command,
            cli::Command::Trades { account: 3, limit: 20, .. }
        ));
    }

    #[test]
    fn parses_auto_trade_rounds() {
        let cli = Cli::try_parse_from(["papertrader", "auto-trade", "-c", "a.ini", "sell"]).unwrap();
        assert!(matches!(
            cli.command,
            cli::Command::AutoTrade {
                round: cli::RoundArg::Sell,
                rule: None,
                ..
            }
        ));
        let cli = Cli::try_parse_from([
            "papertrader", "auto-trade", "-c", "a.ini", "buy", "--rule", "4",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            cli::Command::AutoTrade {
                round: cli::RoundArg::Buy,
                rule: Some(4),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["papertrader", "auto-trade", "-c", "a.ini", "hold"]).is_err());
    }

    #[test]
    fn parses_rule_update_toggle() {
        let cli = Cli::try_parse_from([
            "papertrader", "rule", "-c", "a.ini", "update", "--id", "2", "--active", "false",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            cli::Command::Rule {
                action: cli::RuleCommand::Update {
                    id: 2,
                    active: Some(false),
                    buy_threshold: None,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn order_requires_price() {
        let parsed = Cli::try_parse_from([
            "papertrader", "buy", "-c", "a.ini", "--account", "1", "--symbol", "A", "--quantity", "1",
        ]);
        assert!(parsed.is_err());
    }
}

mod validate_command {
    use super::*;

    #[test]
    fn valid_config_succeeds() {
        let prices = TempDir::new().unwrap();
        let ini = write_temp_ini(&csv_ini(prices.path(), None));
        assert_exit(run(&["validate", "-c", ini.path().to_str().unwrap()]), 0);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert_exit(run(&["validate", "-c", "/nonexistent/papertrader.ini"]), 2);
    }

    #[test]
    fn reversed_dates_are_a_config_error() {
        let ini = write_temp_ini(
            "[data]\nprices_dir = /tmp\n[backtest]\nstart_date = 2024-06-01\nend_date = 2024-01-01\n",
        );
        assert_exit(run(&["validate", "-c", ini.path().to_str().unwrap()]), 2);
    }

    #[test]
    fn missing_data_source_is_a_config_error() {
        let ini = write_temp_ini("[backtest]\nstart_date = 2024-01-01\nend_date = 2024-02-01\n");
        assert_exit(run(&["validate", "-c", ini.path().to_str().unwrap()]), 2);
    }
}

mod backtest_command {
    use super::*;

    #[test]
    fn neutral_run_over_csv_prices_succeeds() {
        let prices = TempDir::new().unwrap();
        write_prices(prices.path(), "DIP", &drop_after_flat(1, "DIP"));
        let ini = write_temp_ini(&csv_ini(prices.path(), None));

        assert_exit(run(&["backtest", "-c", ini.path().to_str().unwrap()]), 0);
    }

    #[test]
    fn trade_log_is_written() {
        let prices = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        write_prices(prices.path(), "DIP", &drop_after_flat(1, "DIP"));
        let predictions = write_predictions(work.path(), "DIP");
        let ini = write_temp_ini(&csv_ini(prices.path(), Some(&predictions)));
        let log = work.path().join("trades.csv");

        let code = run(&[
            "backtest",
            "-c",
            ini.path().to_str().unwrap(),
            "--trades-out",
            log.to_str().unwrap(),
        ]);

        assert_exit(code, 0);
        let content = fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with("executed_at,symbol,side"));
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(",DIP,BUY,"));
        assert!(lines[2].contains(",DIP,SELL(CLOSE),"));
    }

    #[test]
    fn empty_price_directory_is_no_data() {
        let prices = TempDir::new().unwrap();
        let ini = write_temp_ini(&csv_ini(prices.path(), None));
        assert_exit(run(&["backtest", "-c", ini.path().to_str().unwrap()]), 5);
    }

    #[test]
    fn unreadable_predictions_fail_before_running() {
        let prices = TempDir::new().unwrap();
        write_prices(prices.path(), "DIP", &drop_after_flat(1, "DIP"));
        let ini = write_temp_ini(&csv_ini(prices.path(), Some("/nonexistent/predictions.csv")));
        assert_exit(run(&["backtest", "-c", ini.path().to_str().unwrap()]), 3);
    }
}

mod wiring {
    use super::*;

    #[test]
    fn csv_directory_backs_market_data() {
        let prices = TempDir::new().unwrap();
        write_prices(prices.path(), "DIP", &drop_after_flat(1, "DIP"));
        let config = FileConfigAdapter::from_string(&csv_ini(prices.path(), None)).unwrap();

        let stores = cli::open_stores(&config, false).unwrap();
        let instruments = stores.market.list_instruments().unwrap();
        assert_eq!(instruments, vec![Instrument::new(1, "DIP")]);
        assert_eq!(stores.market.fetch_recent(1, 5).unwrap().len(), 5);
    }

    #[test]
    fn durable_commands_need_a_database() {
        let prices = TempDir::new().unwrap();
        let config = FileConfigAdapter::from_string(&csv_ini(prices.path(), None)).unwrap();

        assert!(matches!(
            cli::open_stores(&config, true),
            Err(PapertraderError::ConfigMissing { ref section, ref key })
                if section == "database" && key == "path"
        ));
    }

    #[test]
    fn account_commands_reject_csv_only_configs() {
        let prices = TempDir::new().unwrap();
        let ini = write_temp_ini(&csv_ini(prices.path(), None));
        let path = ini.path().to_str().unwrap();

        assert_exit(run(&["account", "-c", path, "list"]), 2);
        assert_exit(
            run(&["buy", "-c", path, "--account", "1", "--symbol", "DIP", "--quantity", "1", "--price", "80"]),
            2,
        );
    }

    #[test]
    fn predictions_file_is_loaded() {
        let prices = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let predictions = write_predictions(work.path(), "DIP");
        let config =
            FileConfigAdapter::from_string(&csv_ini(prices.path(), Some(&predictions))).unwrap();

        let predictor = cli::open_predictor(&config).unwrap();
        let dip = Instrument::new(1, "DIP");
        assert_eq!(
            predictor.predicted_change(&dip, date(2024, 3, 1)).unwrap(),
            Some(50.0)
        );
        assert_eq!(predictor.predicted_change(&dip, date(2024, 2, 1)).unwrap(), None);
    }

    #[test]
    fn no_predictions_key_is_neutral() {
        let prices = TempDir::new().unwrap();
        let config = FileConfigAdapter::from_string(&csv_ini(prices.path(), None)).unwrap();

        let predictor = cli::open_predictor(&config).unwrap();
        assert_eq!(
            predictor
                .predicted_change(&Instrument::new(1, "DIP"), date(2024, 3, 1))
                .unwrap(),
            None
        );
    }
}

#[cfg(feature = "sqlite")]
mod database_commands {
    use super::*;
    use papertrader::adapters::sqlite_adapter::SqliteAdapter;
    use papertrader::domain::ledger::FeeSchedule;
    use papertrader::ports::repository_port::{AccountRepository, BacktestRepository, RuleRepository};

    struct Workspace {
        dir: TempDir,
        ini: tempfile::NamedTempFile,
    }

    impl Workspace {
        fn new(with_predictions: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let predictions = if with_predictions {
                format!("[data]\npredictions = {}\n", write_predictions(dir.path(), "DIP"))
            } else {
                String::new()
            };
            let ini = write_temp_ini(&format!(
                "[database]\npath = {}\n{}[backtest]\nstart_date = 2024-03-01\nend_date = 2024-03-02\ninitial_balance = 1000000\n",
                dir.path().join("paper.db").display(),
                predictions
            ));
            Workspace { dir, ini }
        }

        fn config(&self) -> &str {
            self.ini.path().to_str().unwrap()
        }

        fn db(&self) -> SqliteAdapter {
            SqliteAdapter::open(self.dir.path().join("paper.db").to_str().unwrap(), 1).unwrap()
        }

        fn import_dip(&self) {
            let prices = self.dir.path().join("dip_prices.csv");
            write_prices(self.dir.path(), "dip_prices", &drop_after_flat(1, "DIP"));
            let code = run(&[
                "import-prices",
                "-c",
                self.config(),
                "--symbol",
                "DIP",
                "--file",
                prices.to_str().unwrap(),
            ]);
            assert_exit(code, 0);
        }
    }

    #[test]
    fn import_then_trade_round_trip() {
        let ws = Workspace::new(false);
        ws.import_dip();
        let c = ws.config();

        assert_exit(run(&["account", "-c", c, "create", "--name", "main", "--balance", "100000"]), 0);
        assert_exit(
            run(&["buy", "-c", c, "--account", "1", "--symbol", "DIP", "--quantity", "100", "--price", "80"]),
            0,
        );
        assert_exit(run(&["mark", "-c", c, "--account", "1"]), 0);
        assert_exit(
            run(&["sell", "-c", c, "--account", "1", "--symbol", "DIP", "--quantity", "40", "--price", "90"]),
            0,
        );
        assert_exit(run(&["positions", "-c", c, "--account", "1"]), 0);
        assert_exit(run(&["trades", "-c", c, "--account", "1"]), 0);
        assert_exit(run(&["account", "-c", c, "show", "--id", "1"]), 0);

        let db = ws.db();
        let account = db.get_account(1).unwrap().unwrap();
        assert_eq!(account.total_trades, 1);
        assert_eq!(account.win_trades, 1);
        let positions = db.list_positions(1).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 60);
        assert_eq!(db.list_trades(1, 10).unwrap().len(), 2);
    }

    #[test]
    fn rejected_and_invalid_orders() {
        let ws = Workspace::new(false);
        ws.import_dip();
        let c = ws.config();
        assert_exit(run(&["account", "-c", c, "create", "--name", "small", "--balance", "1000"]), 0);

        // 100 @ 80 needs 8,001.20
        assert_exit(
            run(&["buy", "-c", c, "--account", "1", "--symbol", "DIP", "--quantity", "100", "--price", "80"]),
            6,
        );
        assert_exit(
            run(&["sell", "-c", c, "--account", "1", "--symbol", "DIP", "--quantity", "1", "--price", "80"]),
            6,
        );
        assert_exit(
            run(&["buy", "-c", c, "--account", "1", "--symbol", "NOPE", "--quantity", "1", "--price", "80"]),
            4,
        );
        assert_exit(run(&["account", "-c", c, "show", "--id", "42"]), 6);

        let db = ws.db();
        assert_eq!(db.get_account(1).unwrap().unwrap().current_balance, 1000.0);
        assert!(db.list_trades(1, 10).unwrap().is_empty());
    }

    #[test]
    fn backtest_results_are_stored() {
        let ws = Workspace::new(true);
        ws.import_dip();
        let c = ws.config();

        assert_exit(run(&["backtest", "-c", c]), 0);
        assert_exit(run(&["results", "-c", c]), 0);
        assert_exit(run(&["results", "-c", c, "--id", "1"]), 0);
        assert_exit(run(&["results", "-c", c, "--id", "999"]), 5);

        let stored = ws.db().list_backtests(10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].trades.len(), 2);
    }

    #[test]
    fn score_persists_and_lists_latest() {
        let ws = Workspace::new(true);
        ws.import_dip();
        let c = ws.config();

        assert_exit(run(&["score", "-c", c]), 0);
        assert_exit(run(&["score", "-c", c, "--latest", "5"]), 0);
    }

    #[test]
    fn rule_lifecycle_and_rounds() {
        let ws = Workspace::new(false);
        ws.import_dip();
        let c = ws.config();
        assert_exit(run(&["account", "-c", c, "create", "--name", "auto", "--balance", "100000"]), 0);

        assert_exit(
            run(&["rule", "-c", c, "create", "--name", "orphan", "--account", "9"]),
            6,
        );
        assert_exit(
            run(&["rule", "-c", c, "create", "--name", "bad", "--account", "1", "--budget-ratio", "2"]),
            4,
        );
        assert_exit(
            run(&["rule", "-c", c, "create", "--name", "daily", "--account", "1", "--buy-threshold", "0"]),
            0,
        );
        assert_exit(run(&["rule", "-c", c, "list"]), 0);

        assert_exit(run(&["auto-trade", "-c", c, "buy", "--rule", "1"]), 0);
        let db = ws.db();
        let positions = db.list_positions(1).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "DIP");
        assert_eq!(
            positions[0].quantity,
            FeeSchedule::default().affordable_quantity(70_000.0, 80.0)
        );

        assert_exit(run(&["auto-trade", "-c", c, "sell"]), 0);
        assert!(db.list_positions(1).unwrap().is_empty());
        assert_eq!(db.list_trades(1, 10).unwrap().len(), 2);
        assert!(db.get_rule(1).unwrap().unwrap().last_executed_at.is_some());

        assert_exit(run(&["rule", "-c", c, "update", "--id", "1", "--active", "false"]), 0);
        assert_exit(run(&["auto-trade", "-c", c, "buy", "--rule", "1"]), 4);
        assert_exit(run(&["rule", "-c", c, "update", "--id", "1"]), 4);
        assert_exit(run(&["rule", "-c", c, "update", "--id", "9", "--active", "true"]), 5);

        assert_exit(run(&["rule", "-c", c, "delete", "--id", "1"]), 0);
        assert_exit(run(&["rule", "-c", c, "delete", "--id", "1"]), 5);
        assert!(db.list_rules().unwrap().is_empty());
        assert_eq!(db.list_trades(1, 10).unwrap().len(), 2);
    }
}
