//! Runtime configuration and validation.

use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

use drover_sched::{SchedConfig, SchedConfigError};

/// Which side of the replication wire this runtime is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Authoritative: owns entities, broadcasts deltas, receives commands.
    Server,
    /// Mirror: seeds entities from snapshots, applies inbound deltas.
    Client,
}

/// Errors detected during [`RuntimeConfig::validate()`].
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeConfigError {
    /// `frame_seconds` is not finite and positive.
    InvalidFrameSeconds {
        /// The rejected value.
        value: f64,
    },
    /// `reaper_interval_frames` is zero.
    ZeroReaperInterval,
    /// The embedded scheduler config is invalid.
    Sched(SchedConfigError),
}

impl fmt::Display for RuntimeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFrameSeconds { value } => {
                write!(f, "frame_seconds must be finite and positive, got {value}")
            }
            Self::ZeroReaperInterval => write!(f, "reaper_interval_frames must be at least 1"),
            Self::Sched(e) => write!(f, "scheduler: {e}"),
        }
    }
}

impl Error for RuntimeConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sched(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SchedConfigError> for RuntimeConfigError {
    fn from(e: SchedConfigError) -> Self {
        Self::Sched(e)
    }
}

/// Complete configuration for constructing a [`Runtime`](crate::Runtime).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Server or client role.
    pub role: Role,
    /// Seed for tick stagger offsets.
    pub seed: u64,
    /// Scheduler settings.
    pub sched: SchedConfig,
    /// Duration of one host frame in seconds. Default: 1/60.
    pub frame_seconds: f64,
    /// Frames between reaper sweeps. Default: 30.
    pub reaper_interval_frames: u32,
    /// Validate inbound replication packets against the schema and drop
    /// violating fields (hardening; the server is authoritative either
    /// way). Default: false.
    pub validate_inbound: bool,
    /// Log ring buffer capacity. Default: 512.
    pub log_capacity: usize,
}

impl RuntimeConfig {
    /// A server-role config with defaults.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            seed: 0,
            sched: SchedConfig::default(),
            frame_seconds: 1.0 / 60.0,
            reaper_interval_frames: 30,
            validate_inbound: false,
            log_capacity: 512,
        }
    }

    /// A client-role config with defaults.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::server()
        }
    }

    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), RuntimeConfigError> {
        // 1. Frame duration must be usable as a period.
        if !self.frame_seconds.is_finite() || self.frame_seconds <= 0.0 {
            return Err(RuntimeConfigError::InvalidFrameSeconds {
                value: self.frame_seconds,
            });
        }
        // 2. The reaper must actually run.
        if self.reaper_interval_frames == 0 {
            return Err(RuntimeConfigError::ZeroReaperInterval);
        }
        // 3. Scheduler settings.
        self.sched.validate()?;
        Ok(())
    }
}
