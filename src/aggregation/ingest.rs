use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AggregationStore;
use crate::bus::FleetEvent;

/// Applies one fleet event to the store. Lifecycle events outside the
/// monitored prefix are ignored.
pub fn apply(store: &AggregationStore, event: FleetEvent, prefix: &str) {
    match event {
        FleetEvent::Lb(samples) => {
            let merged = store.merge_lb(&samples);
            debug!(received = samples.len(), merged, "merged LB batch");
        }
        FleetEvent::Cb(samples) => {
            let merged = store.merge_cb(&samples);
            debug!(received = samples.len(), merged, "merged CB batch");
        }
        FleetEvent::Joined { service, address } if service.starts_with(prefix) => {
            store.join(&service, &address);
        }
        FleetEvent::Left { service, address } if service.starts_with(prefix) => {
            store.leave(&service, &address);
        }
        FleetEvent::Joined { .. } | FleetEvent::Left { .. } => {}
    }
}

/// Receiver loop feeding the store from the fleet channel until cancelled
/// or the channel closes.
pub async fn run(
    store: Arc<AggregationStore>,
    mut rx: broadcast::Receiver<FleetEvent>,
    prefix: String,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => apply(&store, event, &prefix),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "stats receiver lagged, events lost");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, StatsChannel};
    use crate::stats::{StatSample, Tally};

    fn joined(service: &str) -> FleetEvent {
        FleetEvent::Joined {
            service: service.into(),
            address: "127.0.0.1:9001".into(),
        }
    }

    #[test]
    fn lifecycle_outside_prefix_is_ignored() {
        let store = AggregationStore::new();
        apply(&store, joined("internal/Ping"), "api/");
        apply(&store, joined("api/Hello"), "api/");
        store.rotate();

        let shown = store.snapshot();
        assert_eq!(shown.lb.len(), 1);
        assert_eq!(shown.lb[0].service_name, "api/Hello");
    }

    #[tokio::test]
    async fn receiver_merges_published_batches() {
        let store = Arc::new(AggregationStore::new());
        let bus = LocalBus::new("XPTO", 16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(store.clone(), bus.subscribe(), "api/".into(), cancel.clone()));

        let mut sample = StatSample::new("api/Hello", "127.0.0.1:9001");
        sample.tally = Tally { successes: 8, fails: 2, weight: 0 };
        bus.publish(joined("api/Hello")).unwrap();
        bus.publish(FleetEvent::Lb(vec![sample])).unwrap();
        drop(bus);
        task.await.unwrap();

        store.rotate();
        let shown = store.snapshot();
        assert_eq!(shown.lb[0].tally, Tally { successes: 8, fails: 2, weight: 1 });
        assert!(!cancel.is_cancelled());
    }
}
