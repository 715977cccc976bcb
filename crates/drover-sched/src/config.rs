//! Scheduler configuration and validation.

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default per-frame dispatch budget, in seconds (5 ms).
pub const DEFAULT_FRAME_BUDGET: f64 = 0.005;

/// Step-time fallback budget used when `frame_budget` is unset (2 ms).
///
/// The construction-time default is [`DEFAULT_FRAME_BUDGET`]; this lower
/// fallback only applies when an embedder explicitly clears the setting.
/// Both constants are part of the configuration contract.
pub const FALLBACK_FRAME_BUDGET: f64 = 0.002;

/// Errors detected during [`SchedConfig::validate()`].
#[derive(Clone, Debug, PartialEq)]
pub enum SchedConfigError {
    /// `frame_budget` is present but not finite and positive.
    InvalidFrameBudget {
        /// The rejected value, in seconds.
        value: f64,
    },
    /// `aging_factor` is negative, NaN, or infinite.
    InvalidAgingFactor {
        /// The rejected value.
        value: f64,
    },
    /// `history_max` is zero.
    ZeroHistory,
}

impl fmt::Display for SchedConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFrameBudget { value } => {
                write!(f, "frame_budget must be finite and positive, got {value}")
            }
            Self::InvalidAgingFactor { value } => {
                write!(f, "aging_factor must be finite and non-negative, got {value}")
            }
            Self::ZeroHistory => write!(f, "history_max must be at least 1"),
        }
    }
}

impl Error for SchedConfigError {}

/// Scheduler settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Per-frame dispatch budget in seconds. `None` falls back to
    /// [`FALLBACK_FRAME_BUDGET`] at step time. Default: `Some(0.005)`.
    pub frame_budget: Option<f64>,
    /// Effective-priority bonus added per consecutive budget deferral.
    /// Default: 1.0.
    pub aging_factor: f64,
    /// Maximum dispatch records retained in history. Default: 256.
    pub history_max: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            frame_budget: Some(DEFAULT_FRAME_BUDGET),
            aging_factor: 1.0,
            history_max: 256,
        }
    }
}

impl SchedConfig {
    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), SchedConfigError> {
        // 1. frame_budget, if set, must be finite and positive.
        if let Some(budget) = self.frame_budget {
            if !budget.is_finite() || budget <= 0.0 {
                return Err(SchedConfigError::InvalidFrameBudget { value: budget });
            }
        }
        // 2. aging_factor must be finite and non-negative.
        if !self.aging_factor.is_finite() || self.aging_factor < 0.0 {
            return Err(SchedConfigError::InvalidAgingFactor {
                value: self.aging_factor,
            });
        }
        // 3. history must retain at least one record.
        if self.history_max == 0 {
            return Err(SchedConfigError::ZeroHistory);
        }
        Ok(())
    }

    /// The budget applied at step time, in microseconds.
    pub(crate) fn budget_us(&self) -> u64 {
        let secs = self.frame_budget.unwrap_or(FALLBACK_FRAME_BUDGET);
        (secs * 1_000_000.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = SchedConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.frame_budget, Some(DEFAULT_FRAME_BUDGET));
    }

    #[test]
    fn unset_budget_uses_fallback_at_step_time() {
        let cfg = SchedConfig {
            frame_budget: None,
            ..SchedConfig::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.budget_us(), 2_000);
    }

    #[test]
    fn nan_budget_rejected() {
        let cfg = SchedConfig {
            frame_budget: Some(f64::NAN),
            ..SchedConfig::default()
        };
        match cfg.validate() {
            Err(SchedConfigError::InvalidFrameBudget { .. }) => {}
            other => panic!("expected InvalidFrameBudget, got {other:?}"),
        }
    }

    #[test]
    fn negative_aging_rejected() {
        let cfg = SchedConfig {
            aging_factor: -0.5,
            ..SchedConfig::default()
        };
        match cfg.validate() {
            Err(SchedConfigError::InvalidAgingFactor { .. }) => {}
            other => panic!("expected InvalidAgingFactor, got {other:?}"),
        }
    }

    #[test]
    fn zero_history_rejected() {
        let cfg = SchedConfig {
            history_max: 0,
            ..SchedConfig::default()
        };
        match cfg.validate() {
            Err(SchedConfigError::ZeroHistory) => {}
            other => panic!("expected ZeroHistory, got {other:?}"),
        }
    }
}
