//! Coordination quality buckets shared by group sync and reporting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Spread below which a group is rated excellent (seconds)
pub const EXCELLENT_SPREAD_S: f64 = 0.010;
/// Spread below which a group is rated good (seconds)
pub const GOOD_SPREAD_S: f64 = 0.025;
/// Spread below which a group is rated fair (seconds)
pub const FAIR_SPREAD_S: f64 = 0.050;

/// Quality bucket for inter-device offset spread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl CoordinationQuality {
    /// <10ms excellent, <25ms good, <50ms fair, else poor
    pub fn from_spread(spread_seconds: f64) -> Self {
        if spread_seconds < EXCELLENT_SPREAD_S {
            Self::Excellent
        } else if spread_seconds < GOOD_SPREAD_S {
            Self::Good
        } else if spread_seconds < FAIR_SPREAD_S {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

impl fmt::Display for CoordinationQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
