pub mod config;
pub mod error;
pub mod job;
pub mod probe;
pub mod scan;
pub mod queue;
pub mod process;
pub mod invoker;
pub mod progress;
pub mod registry;
pub mod aggregate;
pub mod sink;
pub mod pool;
pub mod shutdown;
pub mod batch;

pub use config::{BatchConfig, OverwritePolicy, Profile};
pub use error::BatchError;
pub use job::{Job, JobKey, JobStatus};
pub use probe::{FfprobeProbe, Probe, ProbeInfo};
pub use invoker::{FfmpegLauncher, Launcher};
pub use aggregate::Summary;
pub use sink::StatusSink;
pub use pool::{SlotState, SlotView};
pub use registry::ControlOutcome;
pub use batch::{Batch, BatchHandle};
