//! Threaded pipelines of fixed-size sample windows.
//!
//! Each stage runs on its own thread, reading windows from its upstream
//! buffer and writing transformed windows to its own. A buffer may feed
//! several consumers, each reading at its own pace; samples stay buffered
//! until the slowest consumer has read them, so no consumer misses a window
//! and a lagging consumer throttles only the producer.
//!
//! # Features
//!
//! - Multi-consumer ring buffers with per-consumer cursors
//! - Blocking reads and writes on a per-buffer condition variable
//! - End-of-stream propagated stage by stage, including after failures
//! - Quiescent window-size changes carried downstream
//! - Abort and optional wait timeouts so a stuck stage never hangs the caller
//! - Per-stage metrics: window counts, waits, transform latency percentiles
//!
//! # Example
//!
//! ```no_run
//! use window_pipeline::{MeanStage, MovingAverageStage, PipelineBuilder};
//!
//! # fn main() -> window_pipeline::Result<()> {
//! let mut builder = PipelineBuilder::new();
//! let samples = builder.source("samples", 512)?;
//! let mean = builder.add_stage(samples, MeanStage::new(512))?;
//! let smooth = builder.add_stage(mean, MovingAverageStage::new(1, 8))?;
//! let mut sink = builder.add_sink(smooth, "out")?;
//!
//! let mut running = builder.build()?.start()?;
//! let mut source = running.take_source(samples).expect("source");
//! std::thread::spawn(move || {
//!     for _ in 0..100 {
//!         source.write_window(&[0.25; 512])?;
//!     }
//!     source.finish();
//!     window_pipeline::Result::Ok(())
//! });
//!
//! while let Some(window) = sink.read_window(None)? {
//!     println!("{:?}", window);
//! }
//! running.wait()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod history;
pub mod metrics;
pub mod pipeline;
pub mod ring;
pub mod stage;
pub mod sync_buffer;

// Re-exports for convenience
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use history::BoundedHistory;
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::{NodeId, Pipeline, PipelineBuilder, RunningPipeline, SourceHandle};
pub use ring::{RingBuffer, Sample, Window};
pub use stage::{MapStage, MeanStage, MovingAverageStage, PassthroughStage, Stage, StageRunner, StageState};
pub use sync_buffer::{AbortHandle, ConsumerId, InputPort, OutputPort, SynchronizedBuffer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
