use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{BacktestMetrics, BacktestTrade};

const EPS: f64 = 1e-12;

/// Full performance metrics from trades and an equity curve.
///
/// Annualization assumes 252 periods per year with a 2% risk-free rate.
#[derive(Debug, Clone, Copy)]
pub struct MetricsCalculator {
    pub risk_free_rate: f64,
    pub periods_per_year: usize,
}

impl Default for MetricsCalculator {
    fn default() -> Self {
        MetricsCalculator {
            risk_free_rate: 0.02,
            periods_per_year: 252,
        }
    }
}

impl MetricsCalculator {
    pub fn new() -> Self {
        MetricsCalculator::default()
    }

    pub fn calculate(
        &self,
        trades: &[BacktestTrade],
        equity_curve: &[(DateTime<Utc>, f64)],
        initial_capital: f64,
    ) -> BacktestMetrics {
        if initial_capital <= 0.0 {
            return BacktestMetrics::default();
        }

        let total_trades = trades.len();
        let winners: Vec<&BacktestTrade> = trades.iter().filter(|t| t.pnl_net > 0.0).collect();
        let losers: Vec<&BacktestTrade> = trades.iter().filter(|t| t.pnl_net < 0.0).collect();
        let breakeven = total_trades - winners.len() - losers.len();
        let win_rate = if total_trades > 0 {
            winners.len() as f64 / total_trades as f64
        } else {
            0.0
        };

        let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();
        let total_pnl_net: f64 = trades.iter().map(|t| t.pnl_net).sum();
        let total_commission: f64 = trades.iter().map(|t| t.commission).sum();
        let total_slippage: f64 = trades.iter().map(|t| t.slippage).sum();

        let avg_pnl_per_trade = safe_div(total_pnl_net, total_trades as f64);
        let avg_pnl_winners = mean(&winners.iter().map(|t| t.pnl_net).collect::<Vec<_>>());
        let avg_pnl_losers = mean(&losers.iter().map(|t| t.pnl_net).collect::<Vec<_>>());

        let profit_factor = self.profit_factor(trades);
        let expectancy = self.expectancy(trades);
        let payoff_ratio = if avg_pnl_losers < 0.0 {
            (avg_pnl_winners / avg_pnl_losers).abs()
        } else {
            0.0
        };
        let r_values: Vec<f64> = trades.iter().filter_map(|t| t.r_multiple).collect();
        let avg_r_multiple = mean(&r_values);

        let (max_dd, dd_duration) = self.max_drawdown(equity_curve);
        let drawdowns = drawdown_series(equity_curve);
        let avg_drawdown = mean(&drawdowns);
        let ulcer = self.ulcer_index(equity_curve);

        let returns = returns_from_equity(equity_curve);
        let sharpe = self.sharpe_ratio(&returns);
        let sortino = self.sortino_ratio(&returns);
        let calmar = self.calmar_ratio(equity_curve);
        let omega = self.omega_ratio(&returns, 0.0);

        let (longest_winning_streak, longest_losing_streak) = streaks(trades);
        let monthly_returns = period_returns(equity_curve, "%Y-%m");
        let yearly_returns = period_returns(equity_curve, "%Y");
        let stability = self.stability_score(&monthly_returns);
        let avg_bars_in_trade = mean(&trades.iter().map(|t| f64::from(t.bars_held)).collect::<Vec<_>>());
        let avg_seconds_between_trades = avg_seconds_between(trades);
        let trades_per_month = trades_per_month(trades);

        BacktestMetrics {
            total_trades,
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            breakeven_trades: breakeven,
            win_rate,
            total_pnl,
            total_pnl_net,
            total_commission,
            total_slippage,
            avg_pnl_per_trade,
            avg_pnl_winners,
            avg_pnl_losers,
            profit_factor,
            expectancy,
            payoff_ratio,
            avg_r_multiple,
            max_drawdown_pct: max_dd,
            max_drawdown_duration_bars: dd_duration,
            avg_drawdown_pct: avg_drawdown,
            ulcer_index: ulcer,
            sharpe_ratio: sharpe,
            sortino_ratio: sortino,
            calmar_ratio: calmar,
            omega_ratio: omega,
            longest_winning_streak,
            longest_losing_streak,
            monthly_returns,
            yearly_returns,
            stability_score: stability,
            avg_bars_in_trade,
            avg_seconds_between_trades,
            trades_per_month,
        }
    }

    /// Annualized Sharpe; zero-variance returns produce 0.
    pub fn sharpe_ratio(&self, returns: &[f64]) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        let rf_per_period = self.risk_free_rate / self.periods_per_year.max(1) as f64;
        let excess: Vec<f64> = returns.iter().map(|r| r - rf_per_period).collect();
        let std = population_std(&excess);
        if std <= EPS {
            return 0.0;
        }
        mean(&excess) / std * (self.periods_per_year as f64).sqrt()
    }

    /// Annualized Sortino; zero downside deviation with positive mean is
    /// +infinity, otherwise 0.
    pub fn sortino_ratio(&self, returns: &[f64]) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        let rf_per_period = self.risk_free_rate / self.periods_per_year.max(1) as f64;
        let excess: Vec<f64> = returns.iter().map(|r| r - rf_per_period).collect();
        let downside: Vec<f64> = excess.iter().map(|r| r.min(0.0).powi(2)).collect();
        let downside_deviation = mean(&downside).sqrt();
        let mean_excess = mean(&excess);
        if downside_deviation <= EPS {
            return if mean_excess > 0.0 { f64::INFINITY } else { 0.0 };
        }
        mean_excess / downside_deviation * (self.periods_per_year as f64).sqrt()
    }

    /// Max peak-to-trough percent drop and its duration in bars.
    pub fn max_drawdown(&self, equity_curve: &[(DateTime<Utc>, f64)]) -> (f64, usize) {
        let mut peak = match equity_curve.first() {
            Some(point) => point.1,
            None => return (0.0, 0),
        };
        let mut max_dd = 0.0;
        let mut max_duration = 0;
        let mut duration = 0;
        for (_, value) in equity_curve {
            if *value >= peak {
                peak = *value;
                duration = 0;
            } else {
                duration += 1;
                let dd = if peak > 0.0 {
                    (peak - value) / peak * 100.0
                } else {
                    0.0
                };
                if dd > max_dd {
                    max_dd = dd;
                    max_duration = duration;
                }
            }
        }
        (max_dd, max_duration)
    }

    pub fn ulcer_index(&self, equity_curve: &[(DateTime<Utc>, f64)]) -> f64 {
        let drawdowns = drawdown_series(equity_curve);
        if drawdowns.is_empty() {
            return 0.0;
        }
        mean(&drawdowns.iter().map(|d| d * d).collect::<Vec<_>>()).sqrt()
    }

    /// Gross profit over absolute gross loss. All winners => +inf, all
    /// losers => 0.
    pub fn profit_factor(&self, trades: &[BacktestTrade]) -> f64 {
        let gross_profit: f64 = trades.iter().filter(|t| t.pnl_net > 0.0).map(|t| t.pnl_net).sum();
        let gross_loss: f64 = trades
            .iter()
            .filter(|t| t.pnl_net < 0.0)
            .map(|t| t.pnl_net)
            .sum::<f64>()
            .abs();
        if gross_loss <= EPS {
            return if gross_profit > 0.0 { f64::INFINITY } else { 0.0 };
        }
        gross_profit / gross_loss
    }

    pub fn expectancy(&self, trades: &[BacktestTrade]) -> f64 {
        if trades.is_empty() {
            return 0.0;
        }
        let winners: Vec<f64> = trades.iter().filter(|t| t.pnl_net > 0.0).map(|t| t.pnl_net).collect();
        let losers: Vec<f64> = trades
            .iter()
            .filter(|t| t.pnl_net < 0.0)
            .map(|t| t.pnl_net.abs())
            .collect();
        let win_rate = winners.len() as f64 / trades.len() as f64;
        let loss_rate = losers.len() as f64 / trades.len() as f64;
        win_rate * mean(&winners) - loss_rate * mean(&losers)
    }

    /// Bar-count CAGR over max drawdown fraction.
    pub fn calmar_ratio(&self, equity_curve: &[(DateTime<Utc>, f64)]) -> f64 {
        if equity_curve.len() < 2 {
            return 0.0;
        }
        let start_value = equity_curve[0].1;
        let end_value = equity_curve[equity_curve.len() - 1].1;
        if start_value <= 0.0 {
            return 0.0;
        }
        let years = (equity_curve.len() - 1) as f64 / self.periods_per_year.max(1) as f64;
        if years <= 0.0 {
            return 0.0;
        }
        let cagr = (end_value / start_value).powf(1.0 / years) - 1.0;
        let (max_dd_pct, _) = self.max_drawdown(equity_curve);
        let max_dd = max_dd_pct / 100.0;
        if max_dd <= EPS {
            return 0.0;
        }
        cagr / max_dd
    }

    pub fn omega_ratio(&self, returns: &[f64], threshold: f64) -> f64 {
        if returns.is_empty() {
            return 0.0;
        }
        let gains: f64 = returns.iter().map(|r| (r - threshold).max(0.0)).sum();
        let losses: f64 = returns.iter().map(|r| (threshold - r).max(0.0)).sum();
        if losses <= EPS {
            return f64::INFINITY;
        }
        gains / losses
    }

    /// Return-consistency score in [0, 1].
    pub fn stability_score(&self, monthly_returns: &BTreeMap<String, f64>) -> f64 {
        if monthly_returns.is_empty() {
            return 0.0;
        }
        let values: Vec<f64> = monthly_returns.values().copied().collect();
        let mean_abs = mean(&values.iter().map(|v| v.abs()).collect::<Vec<_>>());
        if mean_abs <= EPS {
            return 0.0;
        }
        (1.0 - population_std(&values) / mean_abs).clamp(0.0, 1.0)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() <= EPS {
        0.0
    } else {
        numerator / denominator
    }
}

fn returns_from_equity(equity_curve: &[(DateTime<Utc>, f64)]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .map(|pair| {
            let prev = if pair[0].1.abs() <= EPS { EPS } else { pair[0].1 };
            (pair[1].1 - pair[0].1) / prev
        })
        .collect()
}

fn drawdown_series(equity_curve: &[(DateTime<Utc>, f64)]) -> Vec<f64> {
    let mut peak = f64::MIN;
    equity_curve
        .iter()
        .map(|(_, value)| {
            peak = peak.max(*value);
            let safe_peak = if peak.abs() <= EPS { EPS } else { peak };
            (safe_peak - value) / safe_peak * 100.0
        })
        .collect()
}

fn streaks(trades: &[BacktestTrade]) -> (usize, usize) {
    let mut max_win = 0;
    let mut max_loss = 0;
    let mut current_win = 0;
    let mut current_loss = 0;
    for trade in trades {
        if trade.pnl_net > 0.0 {
            current_win += 1;
            current_loss = 0;
        } else if trade.pnl_net < 0.0 {
            current_loss += 1;
            current_win = 0;
        } else {
            current_win = 0;
            current_loss = 0;
        }
        max_win = max_win.max(current_win);
        max_loss = max_loss.max(current_loss);
    }
    (max_win, max_loss)
}

fn period_returns(
    equity_curve: &[(DateTime<Utc>, f64)],
    format: &str,
) -> BTreeMap<String, f64> {
    if equity_curve.len() < 2 {
        return BTreeMap::new();
    }
    let mut points: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (ts, value) in equity_curve {
        points.entry(ts.format(format).to_string()).or_default().push(*value);
    }
    points
        .into_iter()
        .map(|(period, values)| {
            let ret = if values.len() < 2 || values[0] <= 0.0 {
                0.0
            } else {
                (values[values.len() - 1] - values[0]) / values[0] * 100.0
            };
            (period, ret)
        })
        .collect()
}

fn avg_seconds_between(trades: &[BacktestTrade]) -> f64 {
    if trades.len() < 2 {
        return 0.0;
    }
    let mut ordered: Vec<&BacktestTrade> = trades.iter().collect();
    ordered.sort_by_key(|t| t.entry_time);
    let gaps: Vec<f64> = ordered
        .windows(2)
        .map(|pair| (pair[1].entry_time - pair[0].exit_time).num_seconds() as f64)
        .collect();
    mean(&gaps)
}

fn trades_per_month(trades: &[BacktestTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let months: std::collections::BTreeSet<String> = trades
        .iter()
        .map(|t| t.entry_time.format("%Y-%m").to_string())
        .collect();
    trades.len() as f64 / months.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::OrderSide;
    use chrono::{Duration, TimeZone};

    fn make_curve(values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| (start + Duration::days(i as i64), *value))
            .collect()
    }

    fn make_trade(pnl_net: f64, day: i64) -> BacktestTrade {
        let entry = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
        BacktestTrade {
            trade_id: format!("t{day}"),
            symbol: "EURUSD".into(),
            strategy_id: "trend_following".into(),
            side: OrderSide::Buy,
            entry_time: entry,
            exit_time: entry + Duration::hours(5),
            entry_price: 1.1,
            exit_price: 1.1 + pnl_net / 1000.0,
            quantity: 1000.0,
            pnl: pnl_net + 0.5,
            pnl_net,
            commission: 0.5,
            slippage: 0.0,
            bars_held: 5,
            exit_reason: "take_profit".into(),
            r_multiple: Some(pnl_net / 50.0),
            stop_loss: Some(1.095),
            regime_at_entry: "ranging".into(),
            volatility_at_entry: "medium".into(),
            signal_confidence: 0.7,
            max_favorable_excursion: pnl_net.max(0.0),
            max_adverse_excursion: pnl_net.min(0.0),
        }
    }

    #[test]
    fn all_winners_profit_factor_infinite() {
        let calc = MetricsCalculator::new();
        let trades = vec![make_trade(100.0, 0), make_trade(50.0, 1)];
        assert!(calc.profit_factor(&trades).is_infinite());
    }

    #[test]
    fn all_losers_profit_factor_zero() {
        let calc = MetricsCalculator::new();
        let trades = vec![make_trade(-100.0, 0), make_trade(-50.0, 1)];
        assert_eq!(calc.profit_factor(&trades), 0.0);
    }

    #[test]
    fn monotone_equity_has_zero_drawdown() {
        let calc = MetricsCalculator::new();
        let curve = make_curve(&[10_000.0, 10_100.0, 10_200.0, 10_300.0]);
        let (dd, duration) = calc.max_drawdown(&curve);
        assert_eq!(dd, 0.0);
        assert_eq!(duration, 0);
    }

    #[test]
    fn flat_returns_sharpe_zero() {
        let calc = MetricsCalculator::new();
        assert_eq!(calc.sharpe_ratio(&[0.001, 0.001, 0.001]), 0.0);
        assert_eq!(calc.sharpe_ratio(&[]), 0.0);
    }

    #[test]
    fn sortino_infinite_for_all_positive_excess() {
        let calc = MetricsCalculator::new();
        assert!(calc.sortino_ratio(&[0.01, 0.02, 0.03]).is_infinite());
    }

    #[test]
    fn max_drawdown_value_and_duration() {
        let calc = MetricsCalculator::new();
        // Peak 10200, trough 9800 two bars later.
        let curve = make_curve(&[10_000.0, 10_200.0, 10_000.0, 9_800.0, 10_100.0]);
        let (dd, duration) = calc.max_drawdown(&curve);
        assert!((dd - (400.0 / 10_200.0 * 100.0)).abs() < 1e-9);
        assert_eq!(duration, 2);
    }

    #[test]
    fn expectancy_formula() {
        let calc = MetricsCalculator::new();
        let trades = vec![
            make_trade(200.0, 0),
            make_trade(-100.0, 1),
            make_trade(150.0, 2),
            make_trade(-50.0, 3),
        ];
        // 0.5*175 - 0.5*75 = 50
        assert!((calc.expectancy(&trades) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn omega_all_gains_is_infinite() {
        let calc = MetricsCalculator::new();
        assert!(calc.omega_ratio(&[0.01, 0.02], 0.0).is_infinite());
        let mixed = calc.omega_ratio(&[0.02, -0.01], 0.0);
        assert!((mixed - 2.0).abs() < 1e-9);
    }

    #[test]
    fn stability_perfectly_even_is_one() {
        let calc = MetricsCalculator::new();
        let mut monthly = BTreeMap::new();
        monthly.insert("2024-01".to_string(), 2.0);
        monthly.insert("2024-02".to_string(), 2.0);
        assert!((calc.stability_score(&monthly) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn streaks_computed() {
        let trades = vec![
            make_trade(10.0, 0),
            make_trade(-5.0, 1),
            make_trade(-5.0, 2),
            make_trade(-5.0, 3),
            make_trade(10.0, 4),
            make_trade(10.0, 5),
        ];
        let metrics =
            MetricsCalculator::new().calculate(&trades, &make_curve(&[10_000.0, 10_015.0]), 10_000.0);
        assert_eq!(metrics.longest_losing_streak, 3);
        assert_eq!(metrics.longest_winning_streak, 2);
    }

    #[test]
    fn full_calculation_is_coherent() {
        let calc = MetricsCalculator::new();
        let trades = vec![make_trade(100.0, 0), make_trade(-40.0, 2), make_trade(60.0, 5)];
        let curve = make_curve(&[10_000.0, 10_100.0, 10_060.0, 10_120.0]);
        let metrics = calc.calculate(&trades, &curve, 10_000.0);
        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.total_pnl_net - 120.0).abs() < 1e-9);
        assert!(metrics.profit_factor > 1.0);
        assert!(metrics.max_drawdown_pct > 0.0);
        assert_eq!(metrics.monthly_returns.len(), 1);
    }

    #[test]
    fn zero_capital_yields_defaults() {
        let metrics = MetricsCalculator::new().calculate(&[], &[], 0.0);
        assert_eq!(metrics, BacktestMetrics::default());
    }
}
