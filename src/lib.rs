pub mod config;
pub mod streaming;
pub mod tone_server;

pub use config::{ConfigError, PipelineConfig};
pub use streaming::{
    Frame, FrameSource, FreshestSlot, IntensityPipeline, IntensityReducer, PipelineState,
    ReductionMode, StreamError, StreamResult,
};
