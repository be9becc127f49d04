use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use atp::backtest::{
    generate_synthetic_bars, BacktestConfig, BacktestEngine, BacktestMode, BacktestResult,
};
use atp::config::{load_backtest_config, load_config};
use atp::data::{AssetClass, Timeframe};
use atp::signals::strategies::builtin_strategies;
use atp::storage::ParquetStore;

/// Run backtests for one or all built-in strategies.
#[derive(Debug, Parser)]
#[command(name = "run-backtest")]
struct Args {
    #[arg(long, default_value = "trend_following")]
    strategy: String,
    #[arg(long, default_value = "EURUSD")]
    symbol: String,
    #[arg(long, default_value = "mock_dev")]
    broker: String,
    #[arg(long, default_value = "H1")]
    timeframe: String,
    /// Range start (YYYY-MM-DD or RFC3339).
    #[arg(long)]
    start: String,
    /// Range end (YYYY-MM-DD or RFC3339).
    #[arg(long)]
    end: String,
    #[arg(long, default_value = "simple")]
    mode: String,
    /// Backtest every built-in strategy together.
    #[arg(long)]
    all_strategies: bool,
    #[arg(long)]
    initial_capital: Option<f64>,
    #[arg(long, default_value = "data_store/backtest")]
    data_store: PathBuf,
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
}

fn parse_dt(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date: {raw}"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc())
}

fn parse_mode(raw: &str) -> Result<BacktestMode> {
    match raw {
        "simple" => Ok(BacktestMode::Simple),
        "walk_forward" => Ok(BacktestMode::WalkForward),
        "out_of_sample" => Ok(BacktestMode::OutOfSample),
        other => bail!("unknown mode: {other} (expected simple|walk_forward|out_of_sample)"),
    }
}

fn print_result(result: &BacktestResult) {
    println!("{:-<44}", "");
    println!("{:<28}{:>16}", "Metric", "Value");
    println!("{:-<44}", "");
    let metrics = &result.metrics;
    println!("{:<28}{:>16}", "Total trades", metrics.total_trades);
    println!("{:<28}{:>15.2}%", "Win rate", metrics.win_rate * 100.0);
    println!("{:<28}{:>16.3}", "Profit factor", metrics.profit_factor);
    println!("{:<28}{:>16.3}", "Sharpe ratio", metrics.sharpe_ratio);
    println!("{:<28}{:>16.3}", "Sortino ratio", metrics.sortino_ratio);
    println!("{:<28}{:>15.2}%", "Max drawdown", metrics.max_drawdown_pct);
    println!("{:<28}{:>16.2}", "Total PnL (net)", metrics.total_pnl_net);
    println!("{:<28}{:>16.2}", "Expectancy", metrics.expectancy);
    println!("{:-<44}", "");

    if let Some(summary) = &result.wf_summary {
        println!(
            "Walk-forward: avg degradation {:.3}, {:.0}% windows profitable, verdict {}",
            summary.avg_degradation_score,
            summary.pct_windows_profitable * 100.0,
            summary.overall_verdict
        );
    }
    if let Some(report) = &result.oos_report {
        println!(
            "Out-of-sample: sharpe ratio {:.3}, pf ratio {:.3}, verdict {}",
            report.is_vs_oos_sharpe_ratio, report.is_vs_oos_profit_factor, report.verdict
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let module_cfg = load_backtest_config(&args.config_dir.join("backtest.yaml"))?;
    let root_cfg = load_config(&args.config_dir)?;

    let start = parse_dt(&args.start)?;
    let end = parse_dt(&args.end)?;
    let mode = parse_mode(&args.mode)?;
    let timeframe: Timeframe = args.timeframe.parse()?;
    let run_id = format!("run-backtest-{}", Utc::now().timestamp());

    let strategies = if args.all_strategies {
        builtin_strategies()
            .iter()
            .map(|strategy| strategy.strategy_id().to_string())
            .collect()
    } else {
        vec![args.strategy.clone()]
    };

    // Seed the store with deterministic synthetic bars when empty.
    let store = ParquetStore::new(&args.data_store);
    let existing = store
        .load_bars(&args.symbol, &args.broker, timeframe, start, end)
        .await?;
    if existing.is_empty() {
        let bars = generate_synthetic_bars(
            &args.symbol,
            &args.broker,
            timeframe,
            start,
            end,
            module_cfg.backtest.random_seed,
            1.1000,
            AssetClass::detect(&args.symbol),
        );
        tracing::info!(bars = bars.len(), symbol = %args.symbol, "seeding synthetic bars");
        store.save_bars(&bars).await?;
    }

    let config = BacktestConfig {
        run_id: run_id.clone(),
        strategy_ids: strategies,
        symbols: vec![args.symbol.clone()],
        brokers: vec![args.broker.clone()],
        timeframes: vec![timeframe],
        start_date: start,
        end_date: end,
        mode,
        wf_train_periods: module_cfg.backtest.walk_forward.train_periods,
        wf_test_periods: module_cfg.backtest.walk_forward.test_periods,
        wf_step_periods: module_cfg.backtest.walk_forward.step_periods,
        oos_pct: module_cfg.backtest.out_of_sample.oos_pct,
        purge_bars: module_cfg.backtest.out_of_sample.purge_bars,
        initial_capital: args
            .initial_capital
            .unwrap_or(module_cfg.backtest.default_initial_capital),
        currency: module_cfg.backtest.default_currency.clone(),
        use_realistic_fills: module_cfg.backtest.use_realistic_fills,
        warmup_bars: module_cfg.backtest.warmup_bars,
        seed: module_cfg.backtest.random_seed,
    };

    let engine = BacktestEngine::new(
        config,
        root_cfg.signals.clone(),
        root_cfg.risk.clone(),
        &args.data_store,
    )?;
    let result = engine.run().await?;
    print_result(&result);

    let thresholds = &module_cfg.backtest.viability_thresholds;
    let metrics = &result.metrics;
    let viable = metrics.profit_factor >= thresholds.min_profit_factor
        && metrics.sharpe_ratio >= thresholds.min_sharpe_ratio
        && metrics.max_drawdown_pct <= thresholds.max_drawdown_pct
        && metrics.win_rate >= thresholds.min_win_rate
        && metrics.total_trades >= thresholds.min_trades;
    println!("Verdict: {}", if viable { "PASS" } else { "FAIL" });
    if !viable {
        std::process::exit(1);
    }
    Ok(())
}
