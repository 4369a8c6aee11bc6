use std::{path::Path, time::Duration};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Sleep for real while waiting for the next deadline, instead of only
    /// jumping the scheduler clock.
    pub real_time: bool,
    /// Virtual time, in microseconds, that a cycle leaving jobs runnable takes.
    /// Ignored in real time.
    pub cycle_micros: u64,
    /// Upper bound on the cycles `run_until_idle` may run.
    pub max_cycles: Option<u64>,
    /// Echo the value of every toplevel statement on the `result` channel.
    pub report_results: bool,
    /// Number of `called from` lines shown under an error.
    pub backtrace_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            real_time: false,
            cycle_micros: 1000,
            max_cycles: None,
            report_results: true,
            backtrace_depth: 16,
        }
    }
}

impl RuntimeConfig {
    pub fn cycle_time(&self) -> Duration {
        Duration::from_micros(self.cycle_micros)
    }

    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json(&source)
    }
}
