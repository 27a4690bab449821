use crate::model::{PerformanceMetrics, TradeRecord};
use chrono::{DateTime, Duration, NaiveTime, Utc};

/// Profit factor reported when a sample has profits but no losses.
pub const PROFIT_FACTOR_CAP: f64 = 100.0;

/// Profit factor of gross amounts. A loss-free sample is capped, an empty one is 0.
pub fn profit_factor(gross_profit: f64, gross_loss: f64) -> f64 {
    if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        PROFIT_FACTOR_CAP
    } else {
        0.0
    }
}

/// Largest peak-to-trough fall of cumulative P&L, starting from zero.
pub fn max_drawdown<I: IntoIterator<Item = f64>>(profits: I) -> f64 {
    let mut equity = 0.0_f64;
    let mut peak = 0.0_f64;
    let mut worst = 0.0_f64;
    for p in profits {
        equity += p;
        peak = peak.max(equity);
        worst = worst.max(peak - equity);
    }
    worst
}

/// Statistics over trades in the order given.
pub fn compute(trades: &[TradeRecord]) -> PerformanceMetrics {
    let total = trades.len();
    if total == 0 {
        return PerformanceMetrics::default();
    }

    let wins = trades.iter().filter(|t| t.profit > 0.0).count();
    let losses = trades.iter().filter(|t| t.profit < 0.0).count();
    let gross_profit: f64 = trades.iter().filter(|t| t.profit > 0.0).map(|t| t.profit).sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.profit < 0.0)
        .map(|t| -t.profit)
        .sum();
    let net_profit = gross_profit - gross_loss;

    PerformanceMetrics {
        total_trades: total,
        wins,
        losses,
        win_rate: wins as f64 / total as f64 * 100.0,
        gross_profit,
        gross_loss,
        net_profit,
        profit_factor: profit_factor(gross_profit, gross_loss),
        expectancy: net_profit / total as f64,
        max_drawdown: max_drawdown(trades.iter().map(|t| t.profit)),
    }
}

/// Longest run of consecutive losing trades.
pub fn longest_losing_streak(trades: &[TradeRecord]) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for t in trades {
        if t.profit < 0.0 {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Midnight UTC of the day containing `now`.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Trades closed within `window` before `now`.
pub fn closed_within(trades: &[TradeRecord], now: DateTime<Utc>, window: Duration) -> usize {
    let since = now - window;
    trades.iter().filter(|t| t.closed_at > since).count()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::Side;
    use chrono::TimeZone;

    pub(crate) fn trade_at(id: usize, profit: f64, closed_at: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            id: format!("t-{}", id),
            executor_id: "exec-a".into(),
            strategy_id: "strat-1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 0.1,
            profit,
            opened_at: closed_at - Duration::minutes(5),
            closed_at,
        }
    }

    pub(crate) fn trades(profits: &[f64]) -> Vec<TradeRecord> {
        let base = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        profits
            .iter()
            .enumerate()
            .map(|(i, p)| trade_at(i, *p, base + Duration::minutes(i as i64 * 10)))
            .collect()
    }

    #[test]
    fn test_basic_metrics() {
        let m = compute(&trades(&[100.0, -50.0, 30.0, -20.0]));
        assert_eq!(m.total_trades, 4);
        assert_eq!(m.wins, 2);
        assert_eq!(m.losses, 2);
        assert!((m.win_rate - 50.0).abs() < 1e-9);
        assert!((m.profit_factor - 130.0 / 70.0).abs() < 1e-9);
        assert!((m.expectancy - 15.0).abs() < 1e-9);
        // Peak 100 after the first trade, trough 60 after the fourth
        assert!((m.max_drawdown - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_profit_factor_edges() {
        assert_eq!(profit_factor(10.0, 0.0), PROFIT_FACTOR_CAP);
        assert_eq!(profit_factor(0.0, 0.0), 0.0);
        assert_eq!(compute(&[]).profit_factor, 0.0);
    }

    #[test]
    fn test_drawdown_from_zero_start() {
        // An initial loss is a drawdown from the zero starting point
        assert_eq!(max_drawdown([-40.0, 10.0]), 40.0);
        assert_eq!(max_drawdown([10.0, 20.0]), 0.0);
    }

    #[test]
    fn test_losing_streak() {
        let sample = trades(&[-1.0, -1.0, 5.0, -1.0, -1.0, -1.0, 2.0]);
        assert_eq!(longest_losing_streak(&sample), 3);
    }

    #[test]
    fn test_start_of_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 17, 45, 12).unwrap();
        assert_eq!(
            start_of_day(now),
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
        );
    }
}
