use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::window::{Renew, Window};
use crate::stats::{BreakerSample, EndpointKey, StatSample};

impl Renew for StatSample {
    fn renew(&self) -> Self {
        StatSample::new(&self.service_name, &self.location)
    }
}

impl Renew for BreakerSample {
    fn renew(&self) -> Self {
        BreakerSample::new(&self.service_name)
    }
}

/// Payload shipped to the dashboard: LB rows sorted by (service, location),
/// CB rows sorted by service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub lb: Vec<StatSample>,
    pub cb: Vec<BreakerSample>,
}

/// Fleet-wide view of LB and CB statistics.
///
/// Receivers call `merge_*`, `join` and `leave`; all of them touch only the
/// `next` generation. The rotation loop promotes `next` every period and the
/// export side reads `current` through `snapshot()`.
///
/// The LB and CB windows are locked independently, so a snapshot may see
/// one of them rotated and the other not yet.
pub struct AggregationStore {
    lb: Mutex<Window<EndpointKey, StatSample>>,
    cb: Mutex<Window<String, BreakerSample>>,
    rotations: watch::Sender<u64>,
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationStore {
    pub fn new() -> Self {
        let (rotations, _) = watch::channel(0);
        Self {
            lb: Mutex::new(Window::new()),
            cb: Mutex::new(Window::new()),
            rotations,
        }
    }

    /// Folds LB samples into matching rows of the next window.
    /// Samples whose key was never seeded by `join` are dropped.
    /// Returns how many samples were merged.
    pub fn merge_lb(&self, samples: &[StatSample]) -> usize {
        let mut window = self.lb.lock();
        let next = window.next_mut();
        let mut merged = 0;
        for sample in samples {
            match next.get_mut(&sample.key()) {
                Some(row) => {
                    row.tally.fold(sample.tally.successes, sample.tally.fails);
                    row.quarantine = sample.quarantine;
                    merged += 1;
                }
                None => trace!(
                    service = %sample.service_name,
                    location = %sample.location,
                    "dropping LB sample for unseeded endpoint"
                ),
            }
        }
        merged
    }

    /// Folds CB samples into matching service rows of the next window.
    pub fn merge_cb(&self, samples: &[BreakerSample]) -> usize {
        let mut window = self.cb.lock();
        let next = window.next_mut();
        let mut merged = 0;
        for sample in samples {
            match next.get_mut(&sample.service_name) {
                Some(row) => {
                    row.tally.fold(sample.tally.successes, sample.tally.fails);
                    row.state = sample.state;
                    merged += 1;
                }
                None => trace!(
                    service = %sample.service_name,
                    "dropping CB sample for unseeded service"
                ),
            }
        }
        merged
    }

    /// An endpoint registered `service`: (re)seed its LB row with zero
    /// counters and make sure the service has a CB row.
    pub fn join(&self, service: &str, address: &str) {
        self.lb
            .lock()
            .next_mut()
            .insert(EndpointKey::new(service, address), StatSample::new(service, address));

        self.cb
            .lock()
            .next_mut()
            .entry(service.to_owned())
            .or_insert_with(|| BreakerSample::new(service));

        info!(%service, %address, "endpoint joined");
    }

    /// An endpoint dropped `service`. Rows leave the next window only; the
    /// current one keeps showing them until the next rotation.
    ///
    /// The CB row goes too even if other endpoints still serve the service,
    /// since endpoints per service are not counted.
    pub fn leave(&self, service: &str, address: &str) {
        self.lb
            .lock()
            .next_mut()
            .remove(&EndpointKey::new(service, address));
        self.cb.lock().next_mut().remove(service);

        info!(%service, %address, "endpoint left");
    }

    /// Promotes both next windows and notifies export subscribers.
    pub fn rotate(&self) {
        let lb_rows = {
            let mut window = self.lb.lock();
            window.rotate();
            window.current().len()
        };
        let cb_rows = {
            let mut window = self.cb.lock();
            window.rotate();
            window.current().len()
        };
        self.rotations.send_modify(|n| *n += 1);
        debug!(lb_rows, cb_rows, "rotated stats windows");
    }

    /// Rotates every `period` until cancelled.
    pub async fn run_rotation(&self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.rotate(),
            }
        }
    }

    /// Change notifications, one per rotation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.rotations.subscribe()
    }

    /// Sorted copy of the current LB and CB generations.
    pub fn snapshot(&self) -> StatsPayload {
        let mut lb: Vec<StatSample> = self.lb.lock().current().values().cloned().collect();
        let mut cb: Vec<BreakerSample> = self.cb.lock().current().values().cloned().collect();

        lb.sort_unstable_by(|a, b| {
            a.service_name
                .cmp(&b.service_name)
                .then_with(|| a.location.cmp(&b.location))
        });
        cb.sort_unstable_by(|a, b| a.service_name.cmp(&b.service_name));

        StatsPayload { lb, cb }
    }

    /// Current LB rows of a single service, sorted by location.
    pub fn service_rows(&self, service: &str) -> Vec<StatSample> {
        let mut rows: Vec<StatSample> = self
            .lb
            .lock()
            .current()
            .values()
            .filter(|row| row.service_name == service)
            .cloned()
            .collect();
        rows.sort_unstable_by(|a, b| a.location.cmp(&b.location));
        rows
    }

    #[cfg(test)]
    fn next_lb(&self, service: &str, address: &str) -> Option<StatSample> {
        self.lb
            .lock()
            .next()
            .get(&EndpointKey::new(service, address))
            .cloned()
    }

    #[cfg(test)]
    fn next_cb(&self, service: &str) -> Option<BreakerSample> {
        self.cb.lock().next().get(service).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{BreakerState, Tally};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    const HELLO: &str = "api/Hello";
    const A: &str = "127.0.0.1:9001";
    const B: &str = "127.0.0.1:9002";

    fn lb_sample(service: &str, location: &str, successes: u32, fails: u32) -> StatSample {
        let mut sample = StatSample::new(service, location);
        sample.tally = Tally { successes, fails, weight: 0 };
        sample
    }

    fn cb_sample(service: &str, successes: u32, fails: u32, state: BreakerState) -> BreakerSample {
        let mut sample = BreakerSample::new(service);
        sample.tally = Tally { successes, fails, weight: 0 };
        sample.state = state;
        sample
    }

    #[test]
    fn merge_uses_accumulated_average() {
        let store = AggregationStore::new();
        store.join(HELLO, A);

        assert_eq!(store.merge_lb(&[lb_sample(HELLO, A, 100, 1)]), 1);
        assert_eq!(
            store.next_lb(HELLO, A).unwrap().tally,
            Tally { successes: 100, fails: 1, weight: 1 }
        );

        store.merge_lb(&[lb_sample(HELLO, A, 50, 0)]);
        assert_eq!(
            store.next_lb(HELLO, A).unwrap().tally,
            Tally { successes: 75, fails: 0, weight: 2 }
        );
    }

    #[test]
    fn latest_quarantine_and_state_win() {
        let store = AggregationStore::new();
        store.join(HELLO, A);

        let mut quarantined = lb_sample(HELLO, A, 1, 5);
        quarantined.quarantine = true;
        store.merge_lb(&[quarantined, lb_sample(HELLO, A, 9, 0)]);
        assert!(!store.next_lb(HELLO, A).unwrap().quarantine);

        store.merge_cb(&[
            cb_sample(HELLO, 0, 3, BreakerState::Open),
            cb_sample(HELLO, 1, 0, BreakerState::HalfOpen),
        ]);
        assert_eq!(store.next_cb(HELLO).unwrap().state, BreakerState::HalfOpen);
    }

    #[test]
    fn unseeded_samples_are_dropped() {
        let store = AggregationStore::new();
        assert_eq!(store.merge_lb(&[lb_sample(HELLO, A, 10, 0)]), 0);
        assert_eq!(store.merge_cb(&[cb_sample(HELLO, 10, 0, BreakerState::Closed)]), 0);
        assert!(store.next_lb(HELLO, A).is_none());
        assert!(store.next_cb(HELLO).is_none());

        store.rotate();
        assert_eq!(store.snapshot(), StatsPayload::default());
    }

    #[test]
    fn join_reseeds_lb_but_keeps_existing_cb_row() {
        let store = AggregationStore::new();
        store.join(HELLO, A);
        store.merge_lb(&[lb_sample(HELLO, A, 10, 2)]);
        store.merge_cb(&[cb_sample(HELLO, 10, 2, BreakerState::Closed)]);

        store.join(HELLO, B);
        assert_eq!(store.next_cb(HELLO).unwrap().tally.weight, 1);

        store.join(HELLO, A);
        assert_eq!(store.next_lb(HELLO, A).unwrap().tally, Tally::default());
    }

    #[test]
    fn leave_only_affects_next_generation() {
        let store = AggregationStore::new();
        store.join(HELLO, A);
        store.join(HELLO, B);
        store.merge_lb(&[lb_sample(HELLO, B, 4, 4)]);
        store.rotate();

        store.leave(HELLO, B);
        assert!(store.next_lb(HELLO, B).is_none());
        assert!(store.next_cb(HELLO).is_none());
        assert!(store.next_lb(HELLO, A).is_some());

        let shown = store.snapshot();
        assert_eq!(shown.lb.len(), 2);
        assert_eq!(shown.lb[1].tally.successes, 4);
        assert_eq!(shown.cb.len(), 1);

        store.rotate();
        let shown = store.snapshot();
        assert_eq!(shown.lb.len(), 1);
        assert_eq!(shown.lb[0].location, A);
        assert!(shown.cb.is_empty());
    }

    #[test]
    fn rotation_keeps_identity_and_zeroes_counts() {
        let store = AggregationStore::new();
        store.join(HELLO, A);
        store.merge_lb(&[lb_sample(HELLO, A, 30, 3)]);
        store.merge_cb(&[cb_sample(HELLO, 30, 3, BreakerState::Open)]);
        store.rotate();
        assert_eq!(store.snapshot().lb[0].tally.successes, 30);

        store.rotate();
        let shown = store.snapshot();
        assert_eq!(shown.lb, vec![StatSample::new(HELLO, A)]);
        assert_eq!(shown.cb, vec![BreakerSample::new(HELLO)]);
    }

    #[test]
    fn snapshot_is_sorted_by_service_then_location() {
        let store = AggregationStore::new();
        for (service, address) in [
            ("api/Hi", "127.0.0.1:9011"),
            (HELLO, "127.0.0.1:9003"),
            ("api/Hi", "127.0.0.1:9001"),
            (HELLO, A),
            (HELLO, B),
        ] {
            store.join(service, address);
        }
        store.rotate();

        let shown = store.snapshot();
        let order: Vec<_> = shown
            .lb
            .iter()
            .map(|s| (s.service_name.as_str(), s.location.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (HELLO, A),
                (HELLO, B),
                (HELLO, "127.0.0.1:9003"),
                ("api/Hi", "127.0.0.1:9001"),
                ("api/Hi", "127.0.0.1:9011"),
            ]
        );
        let services: Vec<_> = shown.cb.iter().map(|s| s.service_name.as_str()).collect();
        assert_eq!(services, vec![HELLO, "api/Hi"]);
        assert_eq!(store.service_rows("api/Hi").len(), 2);
    }

    #[test]
    fn merged_values_stay_within_input_range() {
        let store = AggregationStore::new();
        store.join(HELLO, A);
        let mut rng = StdRng::seed_from_u64(7);
        let (mut lo, mut hi) = (u32::MAX, 0);

        for _ in 0..500 {
            let successes = rng.gen_range(200..=5_000);
            lo = lo.min(successes);
            hi = hi.max(successes);
            store.merge_lb(&[lb_sample(HELLO, A, successes, 0)]);

            let row = store.next_lb(HELLO, A).unwrap();
            // Truncation drifts downwards by less than one overall.
            assert!(row.tally.successes <= hi);
            assert!(row.tally.successes + 1 >= lo);
        }
        assert_eq!(store.next_lb(HELLO, A).unwrap().tally.weight, 500);
    }

    #[test]
    fn concurrent_merges_stay_bounded() {
        let store = Arc::new(AggregationStore::new());
        store.join(HELLO, A);
        store.join(HELLO, B);

        std::thread::scope(|s| {
            for publisher in 0..8u32 {
                let store = &store;
                s.spawn(move || {
                    for n in 0..200u32 {
                        let value = 100 + (publisher * 31 + n * 7) % 900;
                        store.merge_lb(&[lb_sample(HELLO, A, value, value / 10)]);
                        store.merge_cb(&[cb_sample(HELLO, value, 1, BreakerState::Closed)]);
                        if n % 50 == 0 {
                            store.join(HELLO, B);
                        }
                    }
                });
            }
        });

        let row = store.next_lb(HELLO, A).unwrap();
        assert_eq!(row.tally.weight, 1600);
        assert!((99..=999).contains(&row.tally.successes));
        assert!((9..=99).contains(&row.tally.fails));
        let cb = store.next_cb(HELLO).unwrap();
        assert_eq!(cb.tally.weight, 1600);
        assert!((99..=999).contains(&cb.tally.successes));
    }

    #[tokio::test]
    async fn rotation_notifies_subscribers() {
        let store = AggregationStore::new();
        let mut rx = store.subscribe();
        assert_eq!(*rx.borrow_and_update(), 0);

        store.rotate();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_loop_ticks_every_period() {
        let store = Arc::new(AggregationStore::new());
        store.join(HELLO, A);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let store = store.clone();
            let cancel = cancel.clone();
            async move { store.run_rotation(Duration::from_secs(10), cancel).await }
        });

        let mut rx = store.subscribe();
        rx.changed().await.unwrap();
        assert_eq!(store.snapshot().lb.len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
