use std::fmt;

use serde::{Deserialize, Serialize};

/// Final classification of one VM target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TargetStatus {
    Success,
    Warning,
    Error,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetStatus::Success => "SUCCESS",
            TargetStatus::Warning => "WARNING",
            TargetStatus::Error => "ERROR",
        }
    }

    /// Downgrades `Success` to `Warning`; never upgrades.
    pub fn warn(&mut self) {
        if *self == TargetStatus::Success {
            *self = TargetStatus::Warning;
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Success/warning/error counters aggregated over a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub success: u32,
    pub warning: u32,
    pub error: u32,
}

impl RunSummary {
    pub fn record(&mut self, status: TargetStatus) {
        match status {
            TargetStatus::Success => self.success += 1,
            TargetStatus::Warning => self.warning += 1,
            TargetStatus::Error => self.error += 1,
        }
    }

    pub fn status(&self) -> TargetStatus {
        if self.error > 0 {
            TargetStatus::Error
        } else if self.warning > 0 {
            TargetStatus::Warning
        } else {
            TargetStatus::Success
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S:{} W:{} E:{}", self.success, self.warning, self.error)
    }
}
