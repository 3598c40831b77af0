pub mod ingest;
pub mod store;
pub mod stream;
pub mod window;

pub use store::{AggregationStore, StatsPayload};
