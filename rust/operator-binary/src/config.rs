use std::time::Duration;

use stackable_operator::cli::RunArguments;

use crate::backoff::{
    DEFAULT_BASE_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF, RetryPolicy,
};

#[derive(clap::Subcommand)]
pub enum Command {
    /// Run the integration hub
    Run(HubRunArguments),
}

#[derive(clap::Args)]
pub struct HubRunArguments {
    #[clap(flatten)]
    pub operator: RunArguments,

    #[clap(flatten)]
    pub hub: HubConfig,
}

/// Settings of the hub itself. Durations are given in seconds.
#[derive(clap::Args, Clone, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Namespace holding the relation objects the hub reads and writes.
    #[arg(long, env = "HUB_NAMESPACE")]
    pub hub_namespace: String,

    /// Timeout of every Kubernetes API call.
    #[arg(long = "api-timeout", env = "HUB_API_TIMEOUT", default_value_t = 30)]
    pub api_timeout_seconds: u64,

    /// Delay before the first retry of a failed Kubernetes write.
    #[arg(long = "retry-base", env = "HUB_RETRY_BASE", default_value_t = DEFAULT_BASE_BACKOFF.as_secs())]
    pub retry_base_seconds: u64,

    /// Upper bound of the delay between retries.
    #[arg(long = "retry-cap", env = "HUB_RETRY_CAP", default_value_t = DEFAULT_MAX_BACKOFF.as_secs())]
    pub retry_cap_seconds: u64,

    /// Attempts per Kubernetes write before a tenant is marked as failed.
    #[arg(long, env = "HUB_RETRY_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub retry_max_attempts: u32,

    /// Interval of the periodic status update, which also retries failed tenants.
    #[arg(long = "status-interval", env = "HUB_STATUS_INTERVAL", default_value_t = 300)]
    pub status_interval_seconds: u64,
}

impl HubConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry_base_seconds),
            cap: Duration::from_secs(self.retry_cap_seconds),
            max_attempts: self.retry_max_attempts.max(1),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_seconds.max(1))
    }
}
