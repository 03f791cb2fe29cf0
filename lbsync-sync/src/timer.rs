//! Sequential stage timing.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Wall-clock cost of one executed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTick {
    pub stage: String,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Records the time elapsed since the previous tick (or since creation)
/// under the given stage name. Purely observational.
#[derive(Debug, Clone)]
pub struct StageTimer {
    last: Instant,
    ticks: Vec<StageTick>,
}

impl Default for StageTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            ticks: Vec::new(),
        }
    }

    pub fn tick(&mut self, stage: &str) {
        let now = Instant::now();
        self.ticks.push(StageTick {
            stage: stage.to_string(),
            elapsed: now.duration_since(self.last),
        });
        self.last = now;
    }

    pub fn ticks(&self) -> &[StageTick] {
        &self.ticks
    }

    /// Stage names in tick order.
    pub fn stages(&self) -> Vec<&str> {
        self.ticks.iter().map(|t| t.stage.as_str()).collect()
    }

    pub fn total(&self) -> Duration {
        self.ticks.iter().map(|t| t.elapsed).sum()
    }

    /// `stage=1.234ms stage=0.456ms`
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (i, t) in self.ticks.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{}={:.3}ms", t.stage, t.elapsed.as_secs_f64() * 1000.0);
        }
        out
    }
}
