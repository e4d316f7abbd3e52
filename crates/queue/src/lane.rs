//! Priority lanes and weighted lane selection.

use std::fmt;
use std::str::FromStr;

/// A priority lane. Tasks are FIFO within a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Critical,
    Default,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Critical, Lane::Default];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Default => "default",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::Default => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Self::Critical => Self::Default,
            Self::Default => Self::Critical,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "default" => Ok(Self::Default),
            other => Err(format!("Unknown lane '{other}'")),
        }
    }
}

/// Relative dispatch weights. A zero weight is treated as 1 so no lane
/// can be starved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneWeights {
    pub critical: u32,
    pub default: u32,
}

impl Default for LaneWeights {
    fn default() -> Self {
        Self {
            critical: 6,
            default: 3,
        }
    }
}

impl LaneWeights {
    fn of(&self, lane: Lane) -> i64 {
        let w = match lane {
            Lane::Critical => self.critical,
            Lane::Default => self.default,
        };
        i64::from(w.max(1))
    }
}

/// Smooth weighted round-robin over the two lanes.
///
/// Over every `critical + default` picks each lane is preferred exactly
/// its weight's number of times, interleaved rather than bunched.
#[derive(Debug, Clone)]
pub struct LaneScheduler {
    weights: LaneWeights,
    current: [i64; 2],
}

impl LaneScheduler {
    pub fn new(weights: LaneWeights) -> Self {
        Self {
            weights,
            current: [0; 2],
        }
    }

    /// Lane order for the next claim: preferred lane first, then the
    /// fallback used when the preferred lane is empty.
    pub fn next_order(&mut self) -> [Lane; 2] {
        let total: i64 = Lane::ALL.iter().map(|l| self.weights.of(*l)).sum();
        for lane in Lane::ALL {
            self.current[lane.index()] += self.weights.of(lane);
        }
        let preferred = if self.current[Lane::Critical.index()] >= self.current[Lane::Default.index()] {
            Lane::Critical
        } else {
            Lane::Default
        };
        self.current[preferred.index()] -= total;
        [preferred, preferred.other()]
    }
}
