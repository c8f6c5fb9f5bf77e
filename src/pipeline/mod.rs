pub mod driver;

use thiserror::Error;

use crate::capture::CaptureError;
use crate::reassembly::StreamSummary;
use crate::traffic::{CorrelatorError, Traffic};

pub use driver::{CaptureLoop, CaptureStats, FlowStage, Stage, StopReason, StreamStage};

/// Item carried from the capture side to the metrics sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Traffic(Traffic),
    Stream(StreamSummary),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error("metrics channel closed, no consumer for stream summaries")]
    ChannelClosed,
}
