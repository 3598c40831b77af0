use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{FleetEvent, LocalBus, StatsChannel};
use crate::config::Settings;
use crate::publisher::{GatewayStats, Publisher};
use crate::stats::{
    BreakerMetrics, BreakerState, CircuitBreaker, Endpoint, InstrumentedSelector, MetricsSink,
    QuarantinePolicy, Selector,
};

// ─── Configuration ───────────────────────────────────────────────

/// The one RPC service the simulated gateway calls.
pub const SERVICE_HELLO: &str = "api/Hello";

/// Route the gateway reports its own HTTP traffic under.
pub const GATEWAY_ROUTE: &str = "api/gateway";

/// Simulated endpoints listen on consecutive ports from here.
pub const FIRST_PORT: u16 = 9001;

/// How long an endpoint sits out a request name after failing it.
const QUARANTINE_FOR: Duration = Duration::from_secs(3);

/// Breaker opens after this many consecutive failures…
const MAX_FAILURES: u32 = 3;
/// …and lets a trial call through after this long.
const RESET_TIMEOUT: Duration = Duration::from_secs(15);

/// Simulated RPC deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause between two requests of one worker.
const THINK_TIME: Duration = Duration::from_millis(20);

// ─── Quarantine policy ───────────────────────────────────────────

/// Per-endpoint quarantine: a request name is quarantined for a while after
/// a failed call.
#[derive(Debug, Default)]
pub struct EndpointPolicy {
    until: Mutex<HashMap<String, Instant>>,
}

impl EndpointPolicy {
    pub fn quarantine(&self, request_name: &str, duration: Duration) {
        self.until
            .lock()
            .insert(request_name.to_owned(), Instant::now() + duration);
    }
}

impl QuarantinePolicy for EndpointPolicy {
    fn in_quarantine(&self, request_name: &str) -> bool {
        self.until
            .lock()
            .get(request_name)
            .is_some_and(|until| Instant::now() < *until)
    }
}

// ─── Round-robin selector ────────────────────────────────────────

/// Rotates over endpoints, skipping the ones quarantined for the request
/// name unless every endpoint is.
#[derive(Default)]
pub struct RoundRobin {
    entries: Mutex<Vec<(Endpoint, Arc<EndpointPolicy>)>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn add(&self, address: impl Into<String>) -> Endpoint {
        let policy = Arc::new(EndpointPolicy::default());
        let endpoint = Endpoint::new(address, policy.clone());
        self.entries.lock().push((endpoint.clone(), policy));
        endpoint
    }
}

impl Selector for RoundRobin {
    fn next(&self, request_name: &str) -> Option<Endpoint> {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let pick = (0..entries.len())
            .map(|i| &entries[(start + i) % entries.len()])
            .find(|(_, policy)| !policy.in_quarantine(request_name))
            .unwrap_or(&entries[start % entries.len()]);
        Some(pick.0.clone())
    }

    fn done(&self, endpoint: &Endpoint, request_name: &str, error: Option<&(dyn StdError + 'static)>) {
        if error.is_none() {
            return;
        }
        if let Some((_, policy)) = self
            .entries
            .lock()
            .iter()
            .find(|(e, _)| e.address() == endpoint.address())
        {
            policy.quarantine(request_name, QUARANTINE_FOR);
        }
    }

    fn remove(&self, endpoint: &Endpoint) {
        self.entries
            .lock()
            .retain(|(e, _)| e.address() != endpoint.address());
    }
}

// ─── Circuit breaker ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Opens after `MAX_FAILURES` consecutive failures and half-opens after
/// `RESET_TIMEOUT`. Every outcome is reported into its metrics sink.
pub struct FailureBreaker {
    inner: Mutex<BreakerInner>,
    metrics: Arc<dyn BreakerMetrics>,
}

impl FailureBreaker {
    pub fn new(metrics: Arc<dyn BreakerMetrics>) -> Self {
        Self {
            inner: Mutex::new(BreakerInner::default()),
            metrics,
        }
    }

    pub fn allow(&self) -> bool {
        self.state() != BreakerState::Open
    }

    pub fn record(&self, success: bool) {
        let half_open = self.state() == BreakerState::HalfOpen;
        let mut inner = self.inner.lock();
        if success {
            *inner = BreakerInner::default();
            self.metrics.inc_success();
        } else {
            inner.consecutive_failures += 1;
            if half_open || inner.consecutive_failures >= MAX_FAILURES {
                inner.opened_at = Some(Instant::now());
            }
            self.metrics.inc_failure();
        }
    }
}

impl CircuitBreaker for FailureBreaker {
    fn state(&self) -> BreakerState {
        match self.inner.lock().opened_at {
            None => BreakerState::Closed,
            Some(at) if at.elapsed() >= RESET_TIMEOUT => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }
}

// ─── Simulated backend ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CallError {
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("{0} answered with an error")]
    Failed(String),
}

/// `bad` percent of calls fail; a third of those only after the deadline.
async fn call(rng: &mut StdRng, endpoint: &Endpoint, bad: u8) -> Result<(), CallError> {
    let p = rng.gen_range(0u8..100);
    if p < bad / 3 {
        tokio::time::sleep(REQUEST_TIMEOUT).await;
        return Err(CallError::Timeout(endpoint.address().to_owned()));
    }
    tokio::time::sleep(Duration::from_millis(rng.gen_range(1..5))).await;
    if p < bad {
        Err(CallError::Failed(endpoint.address().to_owned()))
    } else {
        Ok(())
    }
}

// ─── Fleet ───────────────────────────────────────────────────────

/// Runs a gateway process calling `settings.endpoints` simulated endpoints
/// of `SERVICE_HELLO` until cancelled, publishing its stats on `bus`.
pub async fn run(settings: Settings, bus: LocalBus, cancel: CancellationToken) {
    let base = RoundRobin::default();
    let endpoints: Vec<Endpoint> = (0..settings.endpoints)
        .map_while(|i| FIRST_PORT.checked_add(i))
        .map(|port| base.add(format!("127.0.0.1:{port}")))
        .collect();
    let selector = Arc::new(InstrumentedSelector::new(base, settings.prefix.clone()));

    let sink = Arc::new(MetricsSink::new());
    let breaker = Arc::new(FailureBreaker::new(sink.clone()));
    let gateway = Arc::new(GatewayStats::new(
        GATEWAY_ROUTE,
        format!("http://{}", settings.http_addr),
    ));

    let mut announcements: Vec<(&str, String)> = endpoints
        .iter()
        .map(|e| (SERVICE_HELLO, e.address().to_owned()))
        .collect();
    announcements.push((GATEWAY_ROUTE, gateway.location().to_owned()));
    for (service, address) in &announcements {
        announce(&bus, FleetEvent::Joined {
            service: (*service).to_owned(),
            address: address.clone(),
        });
    }
    info!(
        endpoints = endpoints.len(),
        bad = settings.bad,
        concurrency = settings.concurrency,
        "demo fleet started"
    );

    let publisher = Publisher::new(
        selector.clone(),
        sink,
        breaker.clone(),
        SERVICE_HELLO,
        Arc::new(bus.clone()),
        settings.period(),
    )
    .with_gateway(gateway.clone());
    let mut handles = vec![tokio::spawn(publisher.run(cancel.clone()))];

    for worker_id in 0..settings.concurrency {
        let selector = selector.clone();
        let breaker = breaker.clone();
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        let bad = settings.bad;
        handles.push(tokio::spawn(async move {
            worker(worker_id, selector, breaker, gateway, bad, cancel).await;
        }));
    }

    await_tasks(handles).await;

    for endpoint in &endpoints {
        selector.remove(endpoint);
    }
    for (service, address) in announcements {
        announce(&bus, FleetEvent::Left {
            service: service.to_owned(),
            address,
        });
    }
    info!("demo fleet stopped");
}

/// Waits for every task, logging the ones that panicked or were aborted.
/// Returns how many ended that way.
pub async fn await_tasks(handles: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    let mut abnormal = 0;
    for h in handles {
        if let Err(err) = h.await {
            warn!(%err, "task ended abnormally");
            abnormal += 1;
        }
    }
    abnormal
}

fn announce(bus: &LocalBus, event: FleetEvent) {
    if let Err(err) = bus.publish(event) {
        warn!(%err, "lifecycle announcement lost");
    }
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker(
    id: u32,
    selector: Arc<InstrumentedSelector<RoundRobin>>,
    breaker: Arc<FailureBreaker>,
    gateway: Arc<GatewayStats>,
    bad: u8,
    cancel: CancellationToken,
) {
    // Each worker gets its own deterministic RNG seeded uniquely.
    let mut rng = StdRng::seed_from_u64(1000 + id as u64);

    while !cancel.is_cancelled() {
        // An open breaker answers with a fallback, which the gateway
        // still counts as a served request.
        if breaker.allow() {
            if let Some(endpoint) = selector.next(SERVICE_HELLO) {
                let result = call(&mut rng, &endpoint, bad).await;
                let error = result.as_ref().err().map(|e| e as &(dyn StdError + 'static));
                selector.done(&endpoint, SERVICE_HELLO, error);
                breaker.record(result.is_ok());
            }
        }
        gateway.record(true);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(THINK_TIME) => {}
        }
    }
}
