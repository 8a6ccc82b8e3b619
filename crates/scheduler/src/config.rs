//! Executor configuration and retry backoff.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobforge_core::EngineError;

use crate::jobs::types::DEFAULT_RETRIES;

/// Which executor style (if any) is consuming jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Workers are woken with the committed job and claim it directly.
    #[default]
    Reactive,
    /// Workers poll the due queries; hints only shorten the wait.
    Polling,
    /// Nobody is consuming jobs in this process.
    Inactive,
}

impl FromStr for ExecutorMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reactive" => Ok(ExecutorMode::Reactive),
            "polling" => Ok(ExecutorMode::Polling),
            "inactive" => Ok(ExecutorMode::Inactive),
            other => Err(EngineError::configuration(format!("unknown executor mode '{other}'"))),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How long a failed job waits before it becomes due again.
///
/// The number of attempts lives on the job (`retries`); this only shapes the
/// delay between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts failures so
    /// far (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so tests can pin exact values.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Scheduler and executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutorConfig {
    /// Executor name; doubles as the lock owner written into leases.
    pub name: String,
    pub mode: ExecutorMode,
    /// Lease duration for async/message jobs.
    pub async_job_lock_time: Duration,
    /// Lease duration for timers.
    pub timer_lock_time: Duration,
    /// Wait before an async job that lost a commit race is due again.
    pub retry_wait: Duration,
    pub poll_interval: Duration,
    pub max_jobs_per_acquisition: usize,
    pub default_retries: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            mode: ExecutorMode::Reactive,
            async_job_lock_time: Duration::from_secs(300),
            timer_lock_time: Duration::from_secs(300),
            retry_wait: Duration::from_millis(500),
            poll_interval: Duration::from_secs(10),
            max_jobs_per_acquisition: 1,
            default_retries: DEFAULT_RETRIES,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl JobExecutorConfig {
    /// Defaults overlaid with `JOBFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::default().overlay(|key| env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        fn millis(key: &str, value: &str) -> Result<Duration, EngineError> {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| EngineError::configuration(format!("{key} must be milliseconds, got '{value}'")))
        }

        if let Some(name) = lookup("JOBFORGE_EXECUTOR_NAME") {
            self.name = name;
        }
        if let Some(mode) = lookup("JOBFORGE_EXECUTOR_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(v) = lookup("JOBFORGE_LOCK_TIME_MS") {
            let lock = millis("JOBFORGE_LOCK_TIME_MS", &v)?;
            self.async_job_lock_time = lock;
            self.timer_lock_time = lock;
        }
        if let Some(v) = lookup("JOBFORGE_RETRY_WAIT_MS") {
            self.retry_wait = millis("JOBFORGE_RETRY_WAIT_MS", &v)?;
        }
        if let Some(v) = lookup("JOBFORGE_POLL_INTERVAL_MS") {
            self.poll_interval = millis("JOBFORGE_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("JOBFORGE_MAX_JOBS_PER_ACQUISITION") {
            self.max_jobs_per_acquisition = v.trim().parse().map_err(|_| {
                EngineError::configuration(format!("JOBFORGE_MAX_JOBS_PER_ACQUISITION must be a count, got '{v}'"))
            })?;
        }
        Ok(self)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: ExecutorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_lock_time(mut self, lock_time: Duration) -> Self {
        self.async_job_lock_time = lock_time;
        self.timer_lock_time = lock_time;
        self
    }

    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}
