use crate::model::{ParameterSet, RiskSimulation, TradeRecord};
use crate::trade_metrics::{max_drawdown, profit_factor};

/// Largest acceptable relative increase of the projected drawdown, in percent.
pub const MAX_DRAWDOWN_INCREASE_PCT: f64 = 30.0;
/// Smallest acceptable projected profit factor, as percent of baseline.
pub const MIN_PROFIT_FACTOR_RATIO_PCT: f64 = 90.0;

const STOP_LOSS_KEYS: [&str; 2] = ["stopLossPips", "stopLoss"];
const TAKE_PROFIT_KEYS: [&str; 2] = ["takeProfitPips", "takeProfit"];
const LOT_SIZE_KEYS: [&str; 1] = ["lotSize"];

/// new/old for the first key present in both sets; 1.0 when unchanged or unknown.
fn scale_ratio(current: &ParameterSet, proposed: &ParameterSet, keys: &[&str]) -> f64 {
    keys.iter()
        .find_map(|key| match (current.get(*key), proposed.get(*key)) {
            (Some(old), Some(new)) if *old > 0.0 => Some(new / old),
            _ => None,
        })
        .unwrap_or(1.0)
}

/// Round to 6 decimals so exact threshold values compare exactly.
fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Replay `trades` under the current and the proposed parameters.
///
/// Losses scale by the stop-loss ratio, wins by the take-profit ratio and
/// both by the lot-size ratio.
pub fn simulate_risk_impact(
    trades: &[TradeRecord],
    current: &ParameterSet,
    proposed: &ParameterSet,
) -> RiskSimulation {
    let sl_ratio = scale_ratio(current, proposed, &STOP_LOSS_KEYS);
    let tp_ratio = scale_ratio(current, proposed, &TAKE_PROFIT_KEYS);
    let lot_ratio = scale_ratio(current, proposed, &LOT_SIZE_KEYS);

    let baseline: Vec<f64> = trades.iter().map(|t| t.profit).collect();
    let projected: Vec<f64> = baseline
        .iter()
        .map(|p| {
            let scaled = if *p < 0.0 { p * sl_ratio } else { p * tp_ratio };
            scaled * lot_ratio
        })
        .collect();

    let (base_gp, base_gl) = gross(&baseline);
    let (proj_gp, proj_gl) = gross(&projected);
    let baseline_pf = profit_factor(base_gp, base_gl);
    let projected_pf = profit_factor(proj_gp, proj_gl);

    let baseline_dd = max_drawdown(baseline.iter().copied());
    let projected_dd = max_drawdown(projected.iter().copied());

    let drawdown_increase_pct = if baseline_dd > 0.0 {
        round6((projected_dd - baseline_dd) * 100.0 / baseline_dd)
    } else if projected_dd > 0.0 {
        100.0
    } else {
        0.0
    };
    let profit_factor_ratio_pct = if baseline_pf > 0.0 {
        round6(projected_pf * 100.0 / baseline_pf)
    } else {
        100.0
    };

    let mut reasons = Vec::new();
    if drawdown_increase_pct > MAX_DRAWDOWN_INCREASE_PCT {
        reasons.push(format!(
            "Projected drawdown increase {:.2}% exceeds {:.0}% limit",
            drawdown_increase_pct, MAX_DRAWDOWN_INCREASE_PCT
        ));
    }
    if profit_factor_ratio_pct < MIN_PROFIT_FACTOR_RATIO_PCT {
        reasons.push(format!(
            "Projected profit factor {:.2} is {:.2}% of baseline {:.2} (minimum {:.0}%)",
            projected_pf, profit_factor_ratio_pct, baseline_pf, MIN_PROFIT_FACTOR_RATIO_PCT
        ));
    }

    RiskSimulation {
        sample_size: trades.len(),
        stop_loss_ratio: sl_ratio,
        take_profit_ratio: tp_ratio,
        lot_size_ratio: lot_ratio,
        baseline_drawdown: baseline_dd,
        projected_drawdown: projected_dd,
        drawdown_increase_pct,
        baseline_profit_factor: baseline_pf,
        projected_profit_factor: projected_pf,
        profit_factor_ratio_pct,
        acceptable: reasons.is_empty(),
        reasons,
    }
}

fn gross(profits: &[f64]) -> (f64, f64) {
    profits.iter().fold((0.0, 0.0), |(gp, gl), p| {
        if *p > 0.0 {
            (gp + p, gl)
        } else {
            (gp, gl - p)
        }
    })
}
