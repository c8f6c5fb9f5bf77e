pub mod assembler;
pub mod stream;

pub use assembler::{Assembler, AssemblerConfig};
pub use stream::{
    Chunk, CompletionReason, Direction, StatsHandler, StreamHandler, StreamId, StreamState,
    StreamSummary,
};
