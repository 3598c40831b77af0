use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};
use crate::simulator::FIRST_PORT;

/// Default rotation / publish period in seconds.
pub const DEFAULT_PERIOD_SECS: u64 = 10;

/// Only request names under this prefix are instrumented and aggregated.
pub const DEFAULT_PREFIX: &str = "api/";

pub const DEFAULT_CLUSTER: &str = "XPTO";

/// Command line / environment settings for the aggregator process and the
/// demo fleet that feeds it.
#[derive(Debug, Clone, Parser)]
#[command(name = "fleet-stats", about = "Fleet-wide LB/CB telemetry aggregator")]
pub struct Settings {
    /// HTTP address for the dashboard API
    #[arg(long = "http", env = "FLEET_STATS_HTTP", default_value = "0.0.0.0:8070")]
    pub http_addr: String,

    /// Window rotation and publish period (seconds)
    #[arg(long, env = "FLEET_STATS_PERIOD", default_value_t = DEFAULT_PERIOD_SECS)]
    pub period_secs: u64,

    /// Monitored-service prefix
    #[arg(long, env = "FLEET_STATS_PREFIX", default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Cluster / group identity
    #[arg(long, env = "FLEET_STATS_CLUSTER", default_value = DEFAULT_CLUSTER)]
    pub cluster: String,

    /// tracing filter directive, e.g. "info" or "fleet_stats=debug"
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log: String,

    /// Number of simulated service endpoints
    #[arg(long, default_value_t = 3)]
    pub endpoints: u16,

    /// Error percentage rate of the simulated endpoints (0–100)
    #[arg(long, default_value_t = 0)]
    pub bad: u8,

    /// Number of concurrent simulated request workers
    #[arg(long, default_value_t = 4)]
    pub concurrency: u32,
}

impl Settings {
    pub fn validate(&self) -> Result {
        if self.period_secs == 0 {
            return Err(Error::Config("period-secs must be at least 1".into()));
        }
        if self.prefix.is_empty() {
            return Err(Error::Config("prefix must not be empty".into()));
        }
        if self.bad > 100 {
            return Err(Error::Config("bad must be between 0 and 100".into()));
        }
        if self.endpoints > u16::MAX - FIRST_PORT + 1 {
            return Err(Error::Config(format!(
                "endpoints must be at most {}",
                u16::MAX - FIRST_PORT + 1
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}
