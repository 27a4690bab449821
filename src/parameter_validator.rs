use crate::model::ParameterSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// More changed parameters than this in one bundle earns a warning.
pub const MAX_SIMULTANEOUS_CHANGES: usize = 3;

const STEP_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterBounds {
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub step: f64,
    /// Relative change, in percent, above which a change is flagged critical
    pub critical_threshold: f64,
}

impl ParameterBounds {
    const fn new(min: f64, max: f64, default: f64, step: f64, critical_threshold: f64) -> Self {
        Self {
            min,
            max,
            default,
            step,
            critical_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ParameterCheck {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeCheck {
    pub change_percent: f64,
    pub exceeds_threshold: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub changed: Vec<String>,
    pub critical_changes: Vec<String>,
}

/// Per-parameter bounds table for strategy parameters.
#[derive(Debug, Clone)]
pub struct ParameterValidator {
    bounds: HashMap<String, ParameterBounds>,
}

impl Default for ParameterValidator {
    fn default() -> Self {
        let table = [
            ("stopLossPips", ParameterBounds::new(5.0, 200.0, 30.0, 1.0, 50.0)),
            ("takeProfitPips", ParameterBounds::new(5.0, 500.0, 60.0, 1.0, 50.0)),
            ("lotSize", ParameterBounds::new(0.01, 10.0, 0.01, 0.01, 100.0)),
            ("riskPerTrade", ParameterBounds::new(0.1, 5.0, 1.0, 0.1, 50.0)),
            ("maxPositions", ParameterBounds::new(1.0, 20.0, 3.0, 1.0, 100.0)),
            ("trailingStopPips", ParameterBounds::new(0.0, 200.0, 20.0, 1.0, 50.0)),
            ("atrMultiplier", ParameterBounds::new(0.5, 10.0, 2.0, 0.1, 50.0)),
            ("rsiPeriod", ParameterBounds::new(2.0, 100.0, 14.0, 1.0, 50.0)),
            ("rsiOverbought", ParameterBounds::new(50.0, 95.0, 70.0, 1.0, 20.0)),
            ("rsiOversold", ParameterBounds::new(5.0, 50.0, 30.0, 1.0, 20.0)),
            ("emaFastPeriod", ParameterBounds::new(2.0, 200.0, 12.0, 1.0, 50.0)),
            ("emaSlowPeriod", ParameterBounds::new(5.0, 400.0, 26.0, 1.0, 50.0)),
        ];
        Self {
            bounds: table
                .into_iter()
                .map(|(name, b)| (name.to_string(), b))
                .collect(),
        }
    }
}

impl ParameterValidator {
    pub fn with_bounds(bounds: HashMap<String, ParameterBounds>) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self, name: &str) -> Option<&ParameterBounds> {
        self.bounds.get(name)
    }

    pub fn validate_parameter(&self, name: &str, value: f64) -> ParameterCheck {
        let mut check = ParameterCheck::default();

        if !value.is_finite() {
            check.errors.push(format!("{} must be a finite number, got {}", name, value));
            return check;
        }

        match self.bounds.get(name) {
            Some(b) => {
                if value < b.min {
                    check
                        .errors
                        .push(format!("{} = {} is below minimum {}", name, value, b.min));
                }
                if value > b.max {
                    check
                        .errors
                        .push(format!("{} = {} is above maximum {}", name, value, b.max));
                }
                if b.step > 0.0 {
                    let steps = (value - b.min) / b.step;
                    if (steps - steps.round()).abs() > STEP_TOLERANCE {
                        check.warnings.push(format!(
                            "{} = {} is not aligned to step {}",
                            name, value, b.step
                        ));
                    }
                }
            }
            None => check
                .warnings
                .push(format!("No bounds defined for parameter {}", name)),
        }

        check.valid = check.errors.is_empty();
        check
    }

    /// Flags, without blocking, a relative change above the critical threshold.
    pub fn validate_change(&self, name: &str, old: f64, new: f64) -> ChangeCheck {
        let change_percent = if old != 0.0 {
            ((new - old) / old).abs() * 100.0
        } else if new != 0.0 {
            100.0
        } else {
            0.0
        };

        let exceeds_threshold = self
            .bounds
            .get(name)
            .is_some_and(|b| change_percent > b.critical_threshold);

        let message = exceeds_threshold.then(|| {
            format!(
                "Critical change to {}: {} → {} ({:.1}%)",
                name, old, new, change_percent
            )
        });

        ChangeCheck {
            change_percent,
            exceeds_threshold,
            message,
        }
    }

    /// Bounds and change checks across a proposed bundle. Only parameters the
    /// bundle actually changes are held to bounds and the risk limit.
    pub fn validate_parameter_set(
        &self,
        current: &ParameterSet,
        proposed: &ParameterSet,
        max_risk_per_trade: f64,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        for (name, new) in proposed {
            match current.get(name) {
                Some(old) if (old - new).abs() <= f64::EPSILON => continue,
                Some(old) => {
                    let change = self.validate_change(name, *old, *new);
                    if let Some(msg) = change.message {
                        report.critical_changes.push(name.clone());
                        report.warnings.push(msg);
                    }
                }
                None => {}
            }
            report.changed.push(name.clone());

            let check = self.validate_parameter(name, *new);
            report.errors.extend(check.errors);
            report.warnings.extend(check.warnings);

            if name == "riskPerTrade" && *new > max_risk_per_trade {
                report.errors.push(format!(
                    "riskPerTrade {} exceeds safety limit {}",
                    new, max_risk_per_trade
                ));
            }
        }

        if report.changed.len() > MAX_SIMULTANEOUS_CHANGES {
            report.warnings.push(format!(
                "{} parameters changed at once (more than {})",
                report.changed.len(),
                MAX_SIMULTANEOUS_CHANGES
            ));
        }

        report.valid = report.errors.is_empty();
        report
    }
}
