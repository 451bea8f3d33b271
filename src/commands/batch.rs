use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::commands::updater::RecordUpdater;
use crate::config::{parse_env, ConfigError};
use crate::transport::{UpdateOutcome, UpdateRequest};

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Group size and inter-group pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub size: usize,
    pub delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_BATCH_SIZE,
            delay: DEFAULT_BATCH_DELAY,
        }
    }
}

impl BatchConfig {
    /// A size of zero is treated as one.
    pub fn new(size: usize, delay: Duration) -> Self {
        Self {
            size: size.max(1),
            delay,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let size = parse_env("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let delay_ms = parse_env("BATCH_DELAY_MS", DEFAULT_BATCH_DELAY.as_millis() as u64)?;
        Ok(Self::new(size, Duration::from_millis(delay_ms)))
    }
}

/// Outcomes of one batch run, split by result.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub successes: Vec<UpdateOutcome>,
    pub failures: Vec<UpdateOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    /// Percentage of successful outcomes; an empty run reports 0.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.successes.len() as f64 / total as f64 * 100.0,
        }
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            total: self.total(),
            successful: self.successes.len(),
            failed: self.failures.len(),
            success_rate: self.success_rate(),
        }
    }

    fn record(&mut self, outcome: UpdateOutcome) {
        if outcome.success {
            self.successes.push(outcome);
        } else {
            self.failures.push(outcome);
        }
    }
}

/// Runs updates in fixed-size concurrent groups with a pause between groups.
#[derive(Debug, Clone)]
pub struct BatchProcessor<U> {
    updater: U,
    config: BatchConfig,
}

impl<U: RecordUpdater> BatchProcessor<U> {
    pub fn new(updater: U, config: BatchConfig) -> Self {
        Self {
            updater,
            config: BatchConfig::new(config.size, config.delay),
        }
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    /// Every group settles completely before the next starts; per-item failures never abort.
    pub async fn run(&self, requests: Vec<UpdateRequest>) -> BatchReport {
        let size = self.config.size;
        let groups = requests.len().div_ceil(size);
        info!(
            total = requests.len(),
            batch_size = size,
            groups,
            delay_ms = self.config.delay.as_millis() as u64,
            "starting batch update"
        );

        let mut report = BatchReport::default();
        for (index, group) in requests.chunks(size).enumerate() {
            let outcomes = join_all(group.iter().map(|request| self.updater.apply(request))).await;
            let failed = outcomes.iter().filter(|o| !o.success).count();
            for outcome in outcomes {
                report.record(outcome);
            }

            debug!(
                group = index + 1,
                groups,
                group_size = group.len(),
                failed,
                "batch group settled"
            );

            if index + 1 < groups && !self.config.delay.is_zero() {
                sleep(self.config.delay).await;
            }
        }

        let summary = report.summary();
        info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            success_rate = %format!("{:.1}%", summary.success_rate),
            "batch update finished"
        );
        report
    }
}
