// Library exports for traffic-monitor
pub mod capture;
pub mod config;
pub mod dns;
pub mod metrics;
pub mod pipeline;
pub mod reassembly;
pub mod traffic;
pub mod utils;

pub use capture::{decoder, pcap_engine};
pub use config::settings;
pub use metrics::{registry, server, sink};
pub use pipeline::{driver, Observation};
pub use reassembly::{assembler, stream};
pub use traffic::{cache, correlator, model};
pub use utils::formatting;

// Error types
pub use anyhow::{Error, Result};
