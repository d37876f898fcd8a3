pub mod config;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod store;

mod coordinator;

pub use coordinator::{Closed, Coordinator, Event, Handle};
pub use dbft_consensus::{Consensus, ConsensusConfig, ConsensusError, ConsensusMetrics};
pub use dbft_types::mem::{MemLedger, MemPool, MemStore};
