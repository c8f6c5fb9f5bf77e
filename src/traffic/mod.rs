pub mod cache;
pub mod correlator;
pub mod model;

pub use cache::{ConnectionCache, ConnectionEntry};
pub use correlator::{CorrelatorError, CorrelatorStats, FlowCorrelator, LengthPolicy};
pub use model::{FlowKey, IpVersion, Traffic, Transport};
