use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use atp::backtest::{
    generate_synthetic_bars, parse_param_space, BacktestConfig, BacktestEngine, BacktestMode,
    StrategyOptimizer,
};
use atp::config::{load_backtest_config, load_config, save_config};
use atp::data::{AssetClass, Timeframe};
use atp::storage::ParquetStore;

/// Optimize strategy parameters with anti-overfit penalties.
#[derive(Debug, Parser)]
#[command(name = "run-optimization")]
struct Args {
    #[arg(long)]
    strategy: String,
    #[arg(long)]
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
    /// Parameter grid, e.g. "adx_min=15:30:5,rsi_low=20:40:5".
    #[arg(long)]
    params: String,
    #[arg(long, default_value_t = 25)]
    n_trials: usize,
    #[arg(long, default_value = "sharpe_ratio")]
    metric: String,
    /// Persist the best parameters back into config/strategies.yaml.
    #[arg(long)]
    apply: bool,
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

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let module_cfg = load_backtest_config(&args.config_dir.join("backtest.yaml"))?;
    let mut root_cfg = load_config(&args.config_dir)?;
    let param_space = parse_param_space(&args.params)?;

    let start = parse_dt(&args.start)?;
    let end = parse_dt(&args.end)?;
    let timeframe: Timeframe = args.timeframe.parse()?;
    let run_id = format!("run-optimization-{}", Utc::now().timestamp());

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
        run_id,
        strategy_ids: vec![args.strategy.clone()],
        symbols: vec![args.symbol.clone()],
        brokers: vec![args.broker.clone()],
        timeframes: vec![timeframe],
        start_date: start,
        end_date: end,
        mode: BacktestMode::Simple,
        initial_capital: module_cfg.backtest.default_initial_capital,
        currency: module_cfg.backtest.default_currency.clone(),
        use_realistic_fills: module_cfg.backtest.use_realistic_fills,
        warmup_bars: module_cfg.backtest.warmup_bars,
        seed: module_cfg.backtest.random_seed,
        ..BacktestConfig::default()
    };

    let engine = BacktestEngine::new(
        config,
        root_cfg.signals.clone(),
        root_cfg.risk.clone(),
        &args.data_store,
    )?;
    let optimizer = StrategyOptimizer::new(&engine);

    let n_trials = args.n_trials.max(1);
    let progress = ProgressBar::new(n_trials as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:36} {pos}/{len} trials {msg}")
            .expect("static template"),
    );
    let result = optimizer
        .optimize(&args.strategy, &param_space, n_trials, &args.metric, |_, record| {
            progress.set_message(format!("best so far {:.3}", record.score));
            progress.inc(1);
        })
        .await?;
    progress.finish_and_clear();

    println!("{:-<52}", "");
    println!("Strategy:          {}", result.strategy_id);
    println!("Best score:        {:.4}", result.best_score);
    println!("Trials:            {}", result.n_successful_trials);
    println!("Overfitting risk:  {}", result.overfitting_risk.to_uppercase());
    println!("Verdict:           {}", result.verdict);
    println!("Best params:");
    for (name, value) in &result.best_params {
        println!("  {name} = {value}");
    }
    println!("Param importance:");
    for (name, value) in &result.param_importance {
        println!("  {name} = {value:.3}");
    }
    println!("{:-<52}", "");

    if args.apply {
        let mut applied = false;
        for strategy in &mut root_cfg.signals.strategies {
            if strategy.strategy_id != args.strategy {
                continue;
            }
            for (name, value) in &result.best_params {
                strategy.params.set(name, *value);
            }
            applied = true;
        }
        if applied {
            save_config(&root_cfg, &args.config_dir)?;
            println!("Applied best params to {}", args.config_dir.join("strategies.yaml").display());
        } else {
            tracing::warn!(strategy = %args.strategy, "strategy not present in config, nothing applied");
        }
    }
    Ok(())
}
