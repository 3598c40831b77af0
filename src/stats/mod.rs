pub mod selector;
pub mod sink;

pub use selector::{Endpoint, InstrumentedSelector, QuarantinePolicy, Selector};
pub use sink::{BreakerMetrics, MetricsSink};

use serde::{Deserialize, Serialize};

/// Who produced a sample: the RPC transport's load balancer, or the HTTP
/// gateway counting its own requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    #[default]
    TransportNative,
    HttpGateway,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Capability of an external circuit breaker: report where it currently is.
pub trait CircuitBreaker: Send + Sync {
    fn state(&self) -> BreakerState;
}

/// Success/failure pair read out of a `MetricsSink`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub successes: u32,
    pub fails: u32,
}

/// Counters shared by LB and CB rows.
///
/// Once merged by the aggregator, `successes` / `fails` are a cumulative
/// weighted average of per-period values and `weight` is the number of
/// samples folded in since the row was last renewed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub successes: u32,
    pub fails: u32,
    pub weight: u32,
}

impl Tally {
    /// Folds one reported period into the running average:
    /// `(W0 * V0 + V1) / (W0 + 1)`, truncating.
    pub fn fold(&mut self, successes: u32, fails: u32) {
        let w0 = u64::from(self.weight);
        let weight = w0 + 1;
        // Each result is bounded by max(V0, V1) so narrowing back cannot fail.
        self.successes = ((w0 * u64::from(self.successes) + u64::from(successes)) / weight) as u32;
        self.fails = ((w0 * u64::from(self.fails) + u64::from(fails)) / weight) as u32;
        self.weight = weight as u32;
    }
}

impl From<Stats> for Tally {
    fn from(stats: Stats) -> Self {
        Self {
            successes: stats.successes,
            fails: stats.fails,
            weight: 0,
        }
    }
}

/// One reporting unit's view of one endpoint over one period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSample {
    pub service_name: String,
    pub location: String,
    #[serde(flatten)]
    pub tally: Tally,
    /// Reporting period in seconds
    pub period: u32,
    pub source_type: SourceType,
    pub quarantine: bool,
}

impl StatSample {
    pub fn new(service_name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            location: location.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(&self.service_name, &self.location)
    }
}

/// Circuit breaker view of a whole service. There is no endpoint dimension:
/// every endpoint of a service collapses into one row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSample {
    pub service_name: String,
    #[serde(flatten)]
    pub tally: Tally,
    pub period: u32,
    pub source_type: SourceType,
    pub state: BreakerState,
}

impl BreakerSample {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }
}

/// Identity of an LB row: exact (service, endpoint location) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub service: String,
    pub location: String,
}

impl EndpointKey {
    pub fn new(service: &str, location: &str) -> Self {
        Self {
            service: service.to_owned(),
            location: location.to_owned(),
        }
    }
}
