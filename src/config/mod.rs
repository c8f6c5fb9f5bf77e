pub mod settings;

pub use settings::{
    CaptureConfig, Config, ConfigError, DnsConfig, MetricsConfig, Mode, TrackingConfig,
};
