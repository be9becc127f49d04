use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use atp::backtest::{
    generate_synthetic_bars, BacktestConfig, BacktestEngine, BacktestMode, BacktestRuntime,
};
use atp::data::{AssetClass, Timeframe};
use atp::risk::RiskConfig;
use atp::signals::SignalsConfig;
use atp::storage::ParquetStore;

/// Demo scenarios for the data, signal, risk, and backtest subsystems.
#[derive(Debug, Parser)]
#[command(name = "run-demo")]
struct Args {
    /// Subsystem module: 2 (data), 3 (signals), 4 (risk), 5 (backtest).
    #[arg(long)]
    module: u8,
    /// Scenario selector within the module.
    #[arg(long, default_value = "default")]
    scenario: String,
    /// Symbol to synthesize data for.
    #[arg(long, default_value = "EURUSD")]
    asset: String,
    #[arg(long, default_value = "data_store/demo")]
    data_store: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end = start + Duration::days(14);
    let asset_class = AssetClass::detect(&args.asset);

    let store = ParquetStore::new(&args.data_store);
    let bars = generate_synthetic_bars(
        &args.asset,
        "paper",
        Timeframe::H1,
        start,
        end,
        42,
        1.1000,
        asset_class,
    );
    store.save_bars(&bars).await?;
    println!("seeded {} synthetic H1 bars for {}", bars.len(), args.asset);

    match args.module {
        2 => {
            let loaded = store
                .load_bars(&args.asset, "paper", Timeframe::H1, start, end)
                .await?;
            let range = store
                .get_available_range(&args.asset, "paper", Timeframe::H1)
                .await?;
            println!("loaded {} bars back from parquet", loaded.len());
            if let Some((min_open, max_close)) = range {
                println!("available range: {min_open} .. {max_close}");
            }
            let stats = store.storage_stats()?;
            println!(
                "storage: {} files, {} bytes, {} assets",
                stats.file_count, stats.size_bytes, stats.asset_count
            );
        }
        3 | 4 => {
            let runtime = BacktestRuntime::build(
                &format!("demo-{}", args.scenario),
                &args.data_store,
                SignalsConfig::default(),
                &RiskConfig::default(),
                10_000.0,
                false,
                42,
                start,
            )?;
            let as_of = end - Duration::hours(1);
            let decision = runtime
                .signal_engine
                .analyze(&args.asset, "paper", Timeframe::H1, "2h", None, Some(as_of))
                .await?;
            println!(
                "decision: {} at {}% confidence ({})",
                decision.display_decision, decision.confidence_percent, decision.ensemble.explanation
            );
            if args.module == 4 {
                let signal = runtime.signal_engine.final_signal(&decision);
                let account = runtime.order_manager.account().await?;
                let check = runtime
                    .risk_manager
                    .evaluate(&signal, &account, &[], Some(0.0010), None)
                    .await;
                println!(
                    "risk check: {:?}, size {:.4}, sl {:?}, tp {:?}, rr {:.2}",
                    check.status,
                    check.approved_size,
                    check.suggested_sl,
                    check.suggested_tp,
                    check.reward_risk_ratio
                );
                for reason in &check.rejection_reasons {
                    println!("  rejected: {reason}");
                }
            }
        }
        5 => {
            let mode = match args.scenario.as_str() {
                "default" | "simple" => BacktestMode::Simple,
                "walk_forward" => BacktestMode::WalkForward,
                "out_of_sample" => BacktestMode::OutOfSample,
                other => bail!("unknown scenario: {other}"),
            };
            let config = BacktestConfig {
                run_id: format!("demo-{}", args.scenario),
                strategy_ids: vec!["trend_following".into(), "momentum_breakout".into()],
                symbols: vec![args.asset.clone()],
                brokers: vec!["paper".into()],
                timeframes: vec![Timeframe::H1],
                start_date: start,
                end_date: end,
                mode,
                wf_train_periods: 120,
                wf_test_periods: 48,
                wf_step_periods: 48,
                warmup_bars: 100,
                use_realistic_fills: false,
                ..BacktestConfig::default()
            };
            let engine = BacktestEngine::new(
                config,
                SignalsConfig::default(),
                RiskConfig::default(),
                &args.data_store,
            )?;
            let result = engine.run().await?;
            println!(
                "backtest: {} trades, pnl {:.2}, sharpe {:.3}, max dd {:.2}%",
                result.metrics.total_trades,
                result.metrics.total_pnl_net,
                result.metrics.sharpe_ratio,
                result.metrics.max_drawdown_pct
            );
            let mut by_strategy: Vec<_> = result.metrics_by_strategy.iter().collect();
            by_strategy.sort_by(|a, b| a.0.cmp(b.0));
            for (strategy, metrics) in by_strategy {
                println!("  {strategy}: {} trades, pnl {:.2}", metrics.total_trades, metrics.total_pnl_net);
            }
        }
        other => bail!("unknown module: {other} (expected 2, 3, 4, or 5)"),
    }
    Ok(())
}
