use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::stats::{BreakerSample, StatSample};

pub const TOPIC_LB: &str = "stats/lb";
pub const TOPIC_CB: &str = "stats/cb";
pub const TOPIC_JOINED: &str = "lifecycle/joined";
pub const TOPIC_LEFT: &str = "lifecycle/left";

/// Everything that travels over the fleet distribution channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "body")]
pub enum FleetEvent {
    Lb(Vec<StatSample>),
    Cb(Vec<BreakerSample>),
    Joined { service: String, address: String },
    Left { service: String, address: String },
}

impl FleetEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Lb(_) => TOPIC_LB,
            Self::Cb(_) => TOPIC_CB,
            Self::Joined { .. } => TOPIC_JOINED,
            Self::Left { .. } => TOPIC_LEFT,
        }
    }
}

/// Push side of the fleet-wide distribution channel.
pub trait StatsChannel: Send + Sync {
    fn publish(&self, event: FleetEvent) -> Result;
}

/// In-process stand-in for the cluster gossip transport: every subscriber
/// sees every event published after it subscribed.
#[derive(Debug, Clone)]
pub struct LocalBus {
    cluster: String,
    tx: broadcast::Sender<FleetEvent>,
}

impl LocalBus {
    pub fn new(cluster: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            cluster: cluster.into(),
            tx,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl StatsChannel for LocalBus {
    fn publish(&self, event: FleetEvent) -> Result {
        let topic = event.topic();
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| Error::ChannelClosed { topic })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_reports_closed_channel() {
        let bus = LocalBus::new("XPTO", 8);
        let err = bus.publish(FleetEvent::Lb(Vec::new())).unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { topic: TOPIC_LB }));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = LocalBus::new("XPTO", 8);
        let mut rx = bus.subscribe();
        let joined = FleetEvent::Joined {
            service: "api/Hello".into(),
            address: "127.0.0.1:9001".into(),
        };
        bus.publish(joined.clone()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), joined);
        assert_eq!(bus.cluster(), "XPTO");
    }

    #[test]
    fn events_carry_their_topic_on_the_wire() {
        let json = serde_json::to_value(FleetEvent::Cb(Vec::new())).unwrap();
        assert_eq!(json["topic"], "Cb");
        assert_eq!(FleetEvent::Cb(Vec::new()).topic(), "stats/cb");
    }
}
