//! Stage payloads and the runner that drives them.
//!
//! A [`StageRunner`] owns one input port and one output port and moves
//! through [`StageState::Running`], [`StageState::Draining`] and
//! [`StageState::Done`]. When the upstream changes window size, the runner
//! lets the stage adopt the new size and, if its output size changes too,
//! waits for downstream consumers to drain before resizing its own buffer.

use crate::error::{PipelineError, Result};
use crate::history::BoundedHistory;
use crate::metrics::StageMetrics;
use crate::ring::{Sample, Window};
use crate::sync_buffer::{InputPort, OutputPort};
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

/// The transformation a pipeline stage applies to each input window
pub trait Stage: Send + 'static {
    /// Transform one input window. `None` means nothing to emit yet.
    fn process(&mut self, input: &[Sample]) -> Result<Option<Window>>;

    /// Samples per input window
    fn input_window_size(&self) -> usize;

    /// Samples per output window
    fn output_window_size(&self) -> usize;

    /// Input windows consumed before the first output is emitted
    fn window_offset(&self) -> u64 {
        0
    }

    /// Switch to a new input window size after an upstream resize
    fn adopt_input_window_size(&mut self, size: usize) -> Result<()> {
        if size == self.input_window_size() {
            Ok(())
        } else {
            Err(PipelineError::ConfigError(format!(
                "stage '{}' cannot read {}-sample windows",
                self.name(),
                size
            )))
        }
    }

    /// Called before the stage starts processing
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the stage is shutting down
    fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "stage"
    }
}

/// Lifecycle of a running stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Upstream is still producing
    Running,
    /// Upstream reached EOF; reading what is left in the buffer
    Draining,
    /// EOF propagated downstream
    Done,
}

/// Drives one stage: reads from its input port, transforms, writes to its
/// output port, and always leaves the output at EOF when it returns.
pub struct StageRunner {
    input: InputPort,
    output: OutputPort,
    metrics: StageMetrics,
    state: StageState,
    wait_timeout: Option<Duration>,
}

impl StageRunner {
    pub fn new(input: InputPort, output: OutputPort, metrics: StageMetrics) -> Self {
        Self {
            input,
            output,
            metrics,
            state: StageState::Running,
            wait_timeout: None,
        }
    }

    /// Bound every blocking read and write
    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.output.name()
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Run the stage until its input reaches EOF or something fails
    pub fn run(&mut self, mut stage: Box<dyn Stage>) -> Result<()> {
        info!("Stage '{}' started", self.name());
        self.output.notify_consumers_ready();

        let result = self.stream(stage.as_mut());

        self.output.finish();
        self.state = StageState::Done;
        let shutdown = stage.on_shutdown().map_err(|e| self.wrap(e));

        match result.and(shutdown) {
            Ok(()) => {
                info!(
                    "Stage '{}' finished after {} windows",
                    self.name(),
                    self.metrics.windows_read()
                );
                Ok(())
            }
            Err(PipelineError::Aborted) => {
                warn!("Stage '{}' aborted", self.name());
                Err(PipelineError::Aborted)
            }
            Err(e) => {
                error!("Stage '{}' failed: {}", self.name(), e);
                Err(e)
            }
        }
    }

    fn stream(&mut self, stage: &mut dyn Stage) -> Result<()> {
        stage.on_start().map_err(|e| self.wrap(e))?;

        loop {
            let waits = self.input.waits();
            let next = self.input.read_window(self.wait_timeout);
            self.metrics.record_read_waits(self.input.waits() - waits);
            let window = match next? {
                Some(window) => window,
                None => return Ok(()),
            };
            self.metrics.record_read();

            if self.state == StageState::Running && self.input.is_eof() {
                debug!("Stage '{}' draining after upstream EOF", self.name());
                self.state = StageState::Draining;
            }

            self.adopt_if_resized(stage, window.len())?;

            let started = Instant::now();
            let produced = stage.process(&window).map_err(|e| self.wrap(e))?;
            self.metrics.record_latency(started.elapsed());

            if let Some(output) = produced {
                self.emit(&output)?;
            }
        }
    }

    fn emit(&mut self, window: &[Sample]) -> Result<()> {
        let waits = self.output.waits();
        let delivered = self.output.write_window(window, self.wait_timeout);
        self.metrics.record_write_waits(self.output.waits() - waits);
        if delivered? {
            self.metrics.record_emitted();
        } else {
            self.metrics.record_discarded();
        }
        Ok(())
    }

    fn adopt_if_resized(&mut self, stage: &mut dyn Stage, size: usize) -> Result<()> {
        if size == stage.input_window_size() {
            return Ok(());
        }
        let before = stage.output_window_size();
        stage
            .adopt_input_window_size(size)
            .map_err(|e| self.wrap(e))?;
        let after = stage.output_window_size();
        if after != before {
            let waits = self.output.waits();
            let resized = self.output.resize_when_drained(after, self.wait_timeout);
            self.metrics.record_write_waits(self.output.waits() - waits);
            resized?;
        }
        debug!(
            "Stage '{}' adopted {}-sample input windows, emitting {}",
            self.name(),
            size,
            after
        );
        Ok(())
    }

    /// Attribute a payload error to this stage
    fn wrap(&self, err: PipelineError) -> PipelineError {
        match err {
            PipelineError::StageFailed { .. } => err,
            other => PipelineError::stage(self.name(), other),
        }
    }
}

/// Copies each window through unchanged
#[derive(Debug)]
pub struct PassthroughStage {
    window_size: usize,
}

impl PassthroughStage {
    pub fn new(window_size: usize) -> Self {
        Self { window_size }
    }
}

impl Stage for PassthroughStage {
    fn process(&mut self, input: &[Sample]) -> Result<Option<Window>> {
        Ok(Some(input.to_vec()))
    }

    fn input_window_size(&self) -> usize {
        self.window_size
    }

    fn output_window_size(&self) -> usize {
        self.window_size
    }

    fn adopt_input_window_size(&mut self, size: usize) -> Result<()> {
        self.window_size = size;
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Applies a closure to each window
pub struct MapStage<F>
where
    F: FnMut(&[Sample]) -> Result<Window> + Send + 'static,
{
    name: String,
    input_size: usize,
    output_size: usize,
    mapper: F,
}

impl<F> MapStage<F>
where
    F: FnMut(&[Sample]) -> Result<Window> + Send + 'static,
{
    pub fn new(name: impl Into<String>, input_size: usize, output_size: usize, mapper: F) -> Self {
        Self {
            name: name.into(),
            input_size,
            output_size,
            mapper,
        }
    }
}

impl<F> Stage for MapStage<F>
where
    F: FnMut(&[Sample]) -> Result<Window> + Send + 'static,
{
    fn process(&mut self, input: &[Sample]) -> Result<Option<Window>> {
        Ok(Some((self.mapper)(input)?))
    }

    fn input_window_size(&self) -> usize {
        self.input_size
    }

    fn output_window_size(&self) -> usize {
        self.output_size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Reduces each window to its arithmetic mean
#[derive(Debug)]
pub struct MeanStage {
    window_size: usize,
}

impl MeanStage {
    pub fn new(window_size: usize) -> Self {
        Self { window_size }
    }
}

impl Stage for MeanStage {
    fn process(&mut self, input: &[Sample]) -> Result<Option<Window>> {
        if input.is_empty() {
            return Ok(Some(vec![0.0]));
        }
        let sum: Sample = input.iter().sum();
        Ok(Some(vec![sum / input.len() as Sample]))
    }

    fn input_window_size(&self) -> usize {
        self.window_size
    }

    fn output_window_size(&self) -> usize {
        1
    }

    fn adopt_input_window_size(&mut self, size: usize) -> Result<()> {
        self.window_size = size;
        Ok(())
    }

    fn name(&self) -> &str {
        "mean"
    }
}

/// Element-wise mean of the last `depth` input windows.
///
/// Emits nothing for the first `depth - 1` windows, then one window per input.
#[derive(Debug)]
pub struct MovingAverageStage {
    window_size: usize,
    history: BoundedHistory<Window>,
}

impl MovingAverageStage {
    pub fn new(window_size: usize, depth: usize) -> Self {
        Self {
            window_size,
            history: BoundedHistory::new(depth),
        }
    }

    pub fn depth(&self) -> usize {
        self.history.capacity()
    }
}

impl Stage for MovingAverageStage {
    fn process(&mut self, input: &[Sample]) -> Result<Option<Window>> {
        if input.len() != self.window_size {
            return Err(PipelineError::WindowSizeMismatch {
                stage: self.name().to_string(),
                expected: self.window_size,
                actual: input.len(),
            });
        }
        self.history.put(input.to_vec());
        if !self.history.is_full() {
            return Ok(None);
        }

        let mut average = vec![0.0; self.window_size];
        for window in self.history.iter() {
            for (acc, x) in average.iter_mut().zip(window) {
                *acc += x;
            }
        }
        let depth = self.history.size() as Sample;
        average.iter_mut().for_each(|acc| *acc /= depth);
        Ok(Some(average))
    }

    fn input_window_size(&self) -> usize {
        self.window_size
    }

    fn output_window_size(&self) -> usize {
        self.window_size
    }

    fn window_offset(&self) -> u64 {
        (self.history.capacity() - 1) as u64
    }

    fn adopt_input_window_size(&mut self, size: usize) -> Result<()> {
        // averages across different window sizes are meaningless
        self.history.clear();
        self.window_size = size;
        Ok(())
    }

    fn name(&self) -> &str {
        "moving_average"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_buffer::SynchronizedBuffer;
    use std::thread;

    #[test]
    fn test_passthrough_stage() {
        let mut stage = PassthroughStage::new(3);
        let output = stage.process(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(output, Some(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_map_stage() {
        let mut stage = MapStage::new("double", 2, 2, |w: &[Sample]| {
            Ok(w.iter().map(|x| x * 2.0).collect())
        });
        assert_eq!(stage.process(&[1.0, 5.0]).unwrap(), Some(vec![2.0, 10.0]));
        assert_eq!(stage.name(), "double");
    }

    #[test]
    fn test_mean_stage() {
        let mut stage = MeanStage::new(4);
        assert_eq!(stage.process(&[1.0, 2.0, 3.0, 6.0]).unwrap(), Some(vec![3.0]));
        assert_eq!(stage.output_window_size(), 1);
    }

    #[test]
    fn test_moving_average_startup_offset() {
        let mut stage = MovingAverageStage::new(2, 3);
        assert_eq!(stage.window_offset(), 2);
        assert_eq!(stage.process(&[1.0, 10.0]).unwrap(), None);
        assert_eq!(stage.process(&[2.0, 20.0]).unwrap(), None);
        assert_eq!(
            stage.process(&[3.0, 30.0]).unwrap(),
            Some(vec![2.0, 20.0])
        );
        assert_eq!(
            stage.process(&[4.0, 40.0]).unwrap(),
            Some(vec![3.0, 30.0])
        );
    }

    #[test]
    fn test_moving_average_rejects_wrong_width() {
        let mut stage = MovingAverageStage::new(2, 2);
        assert!(matches!(
            stage.process(&[1.0]),
            Err(PipelineError::WindowSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_default_adopt_refuses_other_sizes() {
        let mut stage = MapStage::new("fixed", 4, 4, |w: &[Sample]| Ok(w.to_vec()));
        assert!(stage.adopt_input_window_size(4).is_ok());
        assert!(stage.adopt_input_window_size(8).is_err());
    }

    #[test]
    fn test_runner_streams_and_propagates_eof() {
        let source = SynchronizedBuffer::new("source", 2, 2);
        let input = source.register_consumer("mean", 2).unwrap();
        let mut output = OutputPort::new("mean", 1, 2);
        let mut sink = output.register_consumer("sink", 1).unwrap();
        let metrics = StageMetrics::new();

        let mut runner = StageRunner::new(input, output, metrics.clone());
        let worker = thread::spawn(move || {
            let result = runner.run(Box::new(MeanStage::new(2)));
            (result, runner.state())
        });

        for i in 0..5 {
            let x = i as f32;
            while !source.write(&[x, x + 2.0]) {
                thread::sleep(Duration::from_millis(1));
            }
        }
        source.set_eof();

        let windows = sink.collect_windows(None).unwrap();
        let (result, state) = worker.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(state, StageState::Done);
        assert_eq!(
            windows,
            vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0], vec![5.0]]
        );
        assert_eq!(metrics.windows_read(), 5);
        assert_eq!(metrics.windows_emitted(), 5);
    }

    #[test]
    fn test_runner_failure_still_sets_eof() {
        let source = SynchronizedBuffer::new("source", 1, 2);
        let input = source.register_consumer("broken", 1).unwrap();
        let mut output = OutputPort::new("broken", 1, 2);
        let mut sink = output.register_consumer("sink", 1).unwrap();

        let mut runner = StageRunner::new(input, output, StageMetrics::new());
        let worker = thread::spawn(move || {
            runner.run(Box::new(MapStage::new("broken", 1, 1, |_: &[Sample]| {
                Err(PipelineError::ConfigError("bad coefficients".into()))
            })))
        });

        assert!(source.write(&[1.0]));
        assert_eq!(sink.read_window(None).unwrap(), None);

        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailed { ref stage, .. } if stage == "broken"
        ));
    }

    #[test]
    fn test_runner_follows_upstream_resize_mid_stream() {
        let mut source = OutputPort::new("source", 1, 2);
        let input = source.register_consumer("copy", 1).unwrap();
        let mut output = OutputPort::new("copy", 1, 2);
        let mut sink = output.register_consumer("sink", 1).unwrap();
        let timeout = Some(Duration::from_secs(5));

        let mut runner = StageRunner::new(input, output, StageMetrics::new());
        let worker = thread::spawn(move || runner.run(Box::new(PassthroughStage::new(1))));

        source.write_window(&[1.0], timeout).unwrap();
        // the sink has not read [1.0] yet, so the runner must wait before
        // switching its own output to two-sample windows
        source.resize_when_drained(2, timeout).unwrap();
        source.write_window(&[2.0, 3.0], timeout).unwrap();
        source.write_window(&[4.0, 5.0], timeout).unwrap();
        source.finish();

        let windows = sink.collect_windows(timeout).unwrap();
        assert!(worker.join().unwrap().is_ok());
        assert_eq!(
            windows,
            vec![vec![1.0], vec![2.0, 3.0], vec![4.0, 5.0]]
        );
        assert_eq!(sink.required_input_window_size(), 2);
    }

    #[test]
    fn test_runner_keeps_output_size_when_stage_output_is_fixed() {
        let mut source = OutputPort::new("source", 2, 2);
        let input = source.register_consumer("mean", 2).unwrap();
        let mut output = OutputPort::new("mean", 1, 2);
        let mut sink = output.register_consumer("sink", 1).unwrap();
        let timeout = Some(Duration::from_secs(5));

        let mut runner = StageRunner::new(input, output, StageMetrics::new());
        let worker = thread::spawn(move || runner.run(Box::new(MeanStage::new(2))));

        source.write_window(&[1.0, 3.0], timeout).unwrap();
        source.resize_when_drained(4, timeout).unwrap();
        source.write_window(&[2.0, 2.0, 4.0, 4.0], timeout).unwrap();
        source.finish();

        let windows = sink.collect_windows(timeout).unwrap();
        assert!(worker.join().unwrap().is_ok());
        assert_eq!(windows, vec![vec![2.0], vec![3.0]]);
    }

    #[test]
    fn test_runner_drains_buffered_windows_after_eof() {
        let source = SynchronizedBuffer::new("source", 1, 4);
        let input = source.register_consumer("copy", 1).unwrap();
        let mut output = OutputPort::new("copy", 1, 8);
        let mut sink = output.register_consumer("sink", 1).unwrap();

        assert!(source.write(&[1.0]));
        assert!(source.write(&[2.0]));
        assert!(source.write(&[3.0]));
        source.set_eof();

        let mut runner = StageRunner::new(input, output, StageMetrics::new());
        runner.run(Box::new(PassthroughStage::new(1))).unwrap();
        assert_eq!(runner.state(), StageState::Done);
        assert_eq!(
            sink.collect_windows(None).unwrap(),
            vec![vec![1.0], vec![2.0], vec![3.0]]
        );
    }
}
