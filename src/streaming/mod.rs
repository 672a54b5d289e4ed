// Real-time frame-intensity pipeline
//
// Stereo frames come in from a pluggable source, get coalesced into a single
// freshest value, and are republished at a fixed cadence to a display sink
// and a serial sink.
//
// Architecture:
// - `frame`: stereo sample pair and its 4-byte wire record
// - `source`: trait-based system for pluggable frame sources (WAV, WebSocket, microphone, robot)
// - `reducer`: frame -> normalized intensity rule
// - `slot`: freshest-wins handoff shared between the ingest task and the poller
// - `ingest`: pump + drain tasks feeding the slot
// - `poller`: fixed-cadence consumer driving the sinks
// - `sink`: display and serial consumers
// - `controller`: pipeline object owning all of the above

pub mod controller;
pub mod frame;
pub mod ingest;
pub mod poller;
pub mod reducer;
pub mod sink;
pub mod slot;
pub mod source;
pub mod types;

pub use controller::{IntensityPipeline, PipelineEvent};
pub use frame::Frame;
pub use ingest::{IngestLoop, IngestOutcome, IngestState, IngestStats, IngestTasks};
pub use poller::{Poller, PollerState, TickReport};
pub use reducer::{to_serial_level, IntensityReducer, ReductionMode};
pub use sink::{
    available_ports, DisconnectedSerial, DisplaySink, LatestValueDisplay, LevelBarDisplay,
    SerialEncoding, SerialPortSink, SerialSink,
};
pub use slot::FreshestSlot;
pub use source::{
    create_source, AudioTrack, FrameSource, FrameSourceConfig, MicrophoneFeed, MicrophoneSource,
    SourceMetadata, WavFileSource, WebSocketFrameSource,
};
pub use types::{PipelineState, PipelineStats, StreamError, StreamResult};
