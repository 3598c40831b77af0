use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{FleetEvent, StatsChannel};
use crate::stats::{
    BreakerMetrics, BreakerSample, BreakerState, CircuitBreaker, InstrumentedSelector, MetricsSink,
    Selector, SourceType, StatSample, Tally,
};

/// Counters a gateway keeps for the HTTP route it serves itself.
#[derive(Debug)]
pub struct GatewayStats {
    route: String,
    location: String,
    sink: MetricsSink,
}

impl GatewayStats {
    pub fn new(route: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            location: location.into(),
            sink: MetricsSink::new(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn record(&self, success: bool) {
        if success {
            self.sink.inc_success();
        } else {
            self.sink.inc_failure();
        }
    }
}

/// Periodically drains a process's selector and breaker counters and pushes
/// them onto the fleet channel.
pub struct Publisher<S> {
    selector: Arc<InstrumentedSelector<S>>,
    breaker_metrics: Arc<dyn BreakerMetrics>,
    breaker: Arc<dyn CircuitBreaker>,
    breaker_service: String,
    gateway: Option<Arc<GatewayStats>>,
    channel: Arc<dyn StatsChannel>,
    period: Duration,
}

impl<S: Selector> Publisher<S> {
    pub fn new(
        selector: Arc<InstrumentedSelector<S>>,
        breaker_metrics: Arc<dyn BreakerMetrics>,
        breaker: Arc<dyn CircuitBreaker>,
        breaker_service: impl Into<String>,
        channel: Arc<dyn StatsChannel>,
        period: Duration,
    ) -> Self {
        Self {
            selector,
            breaker_metrics,
            breaker,
            breaker_service: breaker_service.into(),
            gateway: None,
            channel,
            period,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<GatewayStats>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Reads and resets every counter this process owns.
    pub fn collect(&self) -> (Vec<StatSample>, Vec<BreakerSample>) {
        let period = u32::try_from(self.period.as_secs()).unwrap_or(u32::MAX);

        let mut lb = self.selector.clear_stats();
        for sample in &mut lb {
            sample.period = period;
            sample.source_type = SourceType::TransportNative;
        }

        let mut cb = vec![BreakerSample {
            service_name: self.breaker_service.clone(),
            tally: self.breaker_metrics.clear().into(),
            period,
            source_type: SourceType::TransportNative,
            state: self.breaker.state(),
        }];

        if let Some(gateway) = &self.gateway {
            let tally: Tally = gateway.sink.clear().into();
            lb.push(StatSample {
                service_name: gateway.route.clone(),
                location: gateway.location.clone(),
                tally,
                period,
                source_type: SourceType::HttpGateway,
                quarantine: false,
            });
            // The gateway route has no breaker of its own.
            cb.push(BreakerSample {
                service_name: gateway.route.clone(),
                tally,
                period,
                source_type: SourceType::HttpGateway,
                state: BreakerState::Closed,
            });
        }

        (lb, cb)
    }

    /// One publish cycle. A closed channel loses this period's counts.
    pub fn publish(&self) {
        let (lb, cb) = self.collect();
        debug!(lb = lb.len(), cb = cb.len(), "publishing stats");
        for event in [FleetEvent::Lb(lb), FleetEvent::Cb(cb)] {
            if let Err(err) = self.channel.publish(event) {
                warn!(%err, "stats publish failed");
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.publish(),
            }
        }
    }
}
