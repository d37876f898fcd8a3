use metrics::{Counter, Gauge, Histogram, Metrics, NoMetrics};

#[derive(Debug)]
#[non_exhaustive]
pub struct ConsensusMetrics {
    pub height: Box<dyn Gauge>,
    pub view: Box<dyn Gauge>,
    pub committed_blocks: Box<dyn Counter>,
    pub block_transactions: Box<dyn Gauge>,
    pub view_changes: Box<dyn Counter>,
    pub dropped_messages: Box<dyn Counter>,
    pub recovery_messages_sent: Box<dyn Counter>,
    pub block_time: Box<dyn Histogram>,
}

impl Default for ConsensusMetrics {
    fn default() -> Self {
        Self::new(&NoMetrics)
    }
}

impl ConsensusMetrics {
    pub fn new<M: Metrics>(m: &M) -> Self {
        Self {
            height: m.create_gauge("height", None),
            view: m.create_gauge("view", None),
            committed_blocks: m.create_counter("committed_blocks", None),
            block_transactions: m.create_gauge("block_transactions", None),
            view_changes: m.create_counter("view_changes", None),
            dropped_messages: m.create_counter("dropped_messages", None),
            recovery_messages_sent: m.create_counter("recovery_messages_sent", None),
            block_time: m.create_histogram("block_time", Some("seconds")),
        }
    }
}
