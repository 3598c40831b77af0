use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{EndpointKey, StatSample};

/// Decides whether an endpoint is temporarily excluded from routing a
/// given request name.
pub trait QuarantinePolicy: Send + Sync {
    fn in_quarantine(&self, request_name: &str) -> bool;
}

/// One network-addressable instance of a service, as handed out by a
/// `Selector`.
#[derive(Clone)]
pub struct Endpoint {
    address: String,
    policy: Arc<dyn QuarantinePolicy>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, policy: Arc<dyn QuarantinePolicy>) -> Self {
        Self {
            address: address.into(),
            policy,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn policy(&self) -> &Arc<dyn QuarantinePolicy> {
        &self.policy
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Endpoint-selection capability: pick the next endpoint for a request,
/// learn how the call went, forget an endpoint that left.
pub trait Selector: Send + Sync {
    fn next(&self, request_name: &str) -> Option<Endpoint>;
    fn done(&self, endpoint: &Endpoint, request_name: &str, error: Option<&(dyn StdError + 'static)>);
    fn remove(&self, endpoint: &Endpoint);
}

struct Row {
    sample: StatSample,
    // Weak so a removed endpoint's policy is not kept alive by its stats.
    policy: Weak<dyn QuarantinePolicy>,
}

impl Row {
    fn in_quarantine(&self) -> bool {
        self.policy
            .upgrade()
            .is_some_and(|policy| policy.in_quarantine(&self.sample.service_name))
    }
}

/// Wraps any `Selector` and counts per-(request, endpoint) outcomes.
///
/// Routing is delegated untouched; this type only observes `done` and
/// `remove`. The publisher drains the counters with [`clear_stats`].
///
/// [`clear_stats`]: InstrumentedSelector::clear_stats
pub struct InstrumentedSelector<S> {
    inner: S,
    prefix: String,
    rows: Mutex<HashMap<EndpointKey, Row>>,
}

impl<S: Selector> InstrumentedSelector<S> {
    pub fn new(inner: S, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            rows: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of (request, endpoint) rows currently tracked.
    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.rows.lock().len()
    }

    /// Copies every row, then zeroes its counters in place and refreshes
    /// its quarantine flag. Rows stay tracked until their endpoint is removed.
    pub fn clear_stats(&self) -> Vec<StatSample> {
        let mut rows = self.rows.lock();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows.values_mut() {
            out.push(row.sample.clone());
            row.sample.tally.successes = 0;
            row.sample.tally.fails = 0;
            row.sample.quarantine = row.in_quarantine();
        }
        out
    }
}

impl<S: Selector> Selector for InstrumentedSelector<S> {
    fn next(&self, request_name: &str) -> Option<Endpoint> {
        self.inner.next(request_name)
    }

    fn done(&self, endpoint: &Endpoint, request_name: &str, error: Option<&(dyn StdError + 'static)>) {
        self.inner.done(endpoint, request_name, error);

        if !request_name.starts_with(&self.prefix) {
            return;
        }

        let mut rows = self.rows.lock();
        let row = rows
            .entry(EndpointKey::new(request_name, endpoint.address()))
            .or_insert_with(|| Row {
                sample: StatSample::new(request_name, endpoint.address()),
                policy: Arc::downgrade(endpoint.policy()),
            });

        row.sample.quarantine = endpoint.policy().in_quarantine(request_name);
        let tally = &mut row.sample.tally;
        if error.is_none() {
            tally.successes = tally.successes.saturating_add(1);
        } else {
            tally.fails = tally.fails.saturating_add(1);
        }
    }

    fn remove(&self, endpoint: &Endpoint) {
        self.inner.remove(endpoint);

        let address = endpoint.address();
        self.rows.lock().retain(|key, _| key.location != address);
    }
}
