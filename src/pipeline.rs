//! Pipeline assembly and the handles of a running pipeline.
//!
//! [`PipelineBuilder`] registers every consumer before any thread starts,
//! [`Pipeline::start`] spawns one thread per stage, and the resulting
//! [`RunningPipeline`] hands out [`SourceHandle`]s and collects stage exits.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::metrics::StageMetrics;
use crate::ring::Sample;
use crate::stage::{Stage, StageRunner};
use crate::sync_buffer::{AbortHandle, InputPort, OutputPort};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

/// Handle to a source or stage inside a pipeline under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

enum NodeKind {
    Source,
    Stage {
        stage: Box<dyn Stage>,
        input: InputPort,
    },
}

struct Node {
    name: String,
    output: OutputPort,
    metrics: StageMetrics,
    kind: NodeKind,
    upstream: Option<NodeId>,
}

/// Wires sources, stages and sinks together before any thread starts.
///
/// Every consumer registration and resize happens here, so the buffers are
/// sized before the first window is written.
pub struct PipelineBuilder {
    config: PipelineConfig,
    nodes: Vec<Node>,
}

impl PipelineBuilder {
    /// Create a new pipeline builder with the default configuration
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Add an external sample source producing `window_size`-sample windows
    pub fn source(&mut self, name: impl Into<String>, window_size: usize) -> Result<NodeId> {
        let name = name.into();
        self.check_new_node(&name, window_size)?;
        let output = OutputPort::new(name.clone(), window_size, self.config.buffer_depth);
        Ok(self.push(name, output, NodeKind::Source, None))
    }

    /// Add a stage reading from `upstream`, named after [`Stage::name`].
    ///
    /// Several stages may read from the same upstream; each gets its own
    /// cursor into the upstream buffer.
    pub fn add_stage(&mut self, upstream: NodeId, stage: impl Stage) -> Result<NodeId> {
        let name = stage.name().to_string();
        self.add_named_stage(upstream, name, stage)
    }

    /// Add a stage under a caller-chosen node name, for pipelines holding
    /// more than one instance of the same stage type.
    pub fn add_named_stage(
        &mut self,
        upstream: NodeId,
        name: impl Into<String>,
        stage: impl Stage,
    ) -> Result<NodeId> {
        let name = name.into();
        self.check_new_node(&name, stage.output_window_size())?;

        let parent = self.node_mut(upstream)?;
        let input = parent
            .output
            .register_consumer(name.clone(), stage.input_window_size())?;
        let window_offset = parent.output.window_offset() + stage.window_offset();

        let mut output = OutputPort::new(
            name.clone(),
            stage.output_window_size(),
            self.config.buffer_depth,
        );
        output.set_window_offset(window_offset);

        let kind = NodeKind::Stage {
            stage: Box::new(stage),
            input,
        };
        Ok(self.push(name, output, kind, Some(upstream)))
    }

    /// Attach a terminal consumer to `upstream` and return its port.
    ///
    /// The caller must keep reading the port, or drop it: a sink that is
    /// held but never read stalls its upstream once the buffer fills.
    pub fn add_sink(&mut self, upstream: NodeId, name: impl Into<String>) -> Result<InputPort> {
        let parent = self.node_mut(upstream)?;
        let window_size = parent.output.output_window_size();
        parent.output.register_consumer(name, window_size)
    }

    /// Change the output window size of `node` and carry the change down to
    /// every stage that reads it.
    ///
    /// A stage decides its own output size, so a stage node only accepts the
    /// size its stage already produces; resize the node feeding it instead.
    pub fn resize(&mut self, node: NodeId, window_size: usize) -> Result<()> {
        let target = self.node_mut(node)?;
        if let NodeKind::Stage { stage, .. } = &target.kind {
            if stage.output_window_size() != window_size {
                return Err(PipelineError::ConfigError(format!(
                    "stage '{}' emits {}-sample windows, cannot resize it to {}",
                    target.name,
                    stage.output_window_size(),
                    window_size
                )));
            }
        }
        target.output.resize(window_size)?;
        debug!(
            "Resized '{}' output to {} samples",
            self.nodes[node.0].name, window_size
        );

        let downstream: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].upstream == Some(node))
            .collect();
        for i in downstream {
            let resized = match &mut self.nodes[i].kind {
                NodeKind::Stage { stage, .. } => {
                    let before = stage.output_window_size();
                    stage.adopt_input_window_size(window_size)?;
                    let after = stage.output_window_size();
                    (after != before).then_some(after)
                }
                NodeKind::Source => None,
            };
            if let Some(size) = resized {
                self.resize(NodeId(i), size)?;
            }
        }
        Ok(())
    }

    /// Finish assembly
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let has_stage = self
            .nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Stage { .. }));
        if !has_stage {
            return Err(PipelineError::NoStages);
        }
        Ok(Pipeline {
            config: self.config,
            nodes: self.nodes,
        })
    }

    fn check_new_node(&self, name: &str, window_size: usize) -> Result<()> {
        if window_size == 0 {
            return Err(PipelineError::ConfigError(format!(
                "'{}' has an empty output window",
                name
            )));
        }
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(PipelineError::ConfigError(format!(
                "duplicate node name '{}'; use add_named_stage to tell instances apart",
                name
            )));
        }
        Ok(())
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| PipelineError::UnknownNode(format!("#{}", id.0)))
    }

    fn push(
        &mut self,
        name: String,
        output: OutputPort,
        kind: NodeKind,
        upstream: Option<NodeId>,
    ) -> NodeId {
        self.nodes.push(Node {
            name,
            output,
            metrics: StageMetrics::new(),
            kind,
            upstream,
        });
        NodeId(self.nodes.len() - 1)
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An assembled pipeline, ready to start
pub struct Pipeline {
    config: PipelineConfig,
    nodes: Vec<Node>,
}

impl Pipeline {
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn stage_metrics(&self, name: &str) -> Option<&StageMetrics> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| &n.metrics)
    }

    /// Input windows a node swallows before its first output
    pub fn window_offset(&self, node: NodeId) -> Option<u64> {
        self.nodes.get(node.0).map(|n| n.output.window_offset())
    }

    /// Spawn one thread per stage
    pub fn start(self) -> Result<RunningPipeline> {
        let (exit_tx, exit_rx) = unbounded();
        let mut running = RunningPipeline {
            workers: Vec::new(),
            sources: Vec::new(),
            abort_handles: Vec::new(),
            metrics: Vec::new(),
            exits: exit_rx,
        };

        for (index, node) in self.nodes.into_iter().enumerate() {
            running.abort_handles.extend(node.output.abort_handle());
            running
                .metrics
                .push((node.name.clone(), node.metrics.clone()));

            match node.kind {
                NodeKind::Source => {
                    running.sources.push((
                        NodeId(index),
                        SourceHandle {
                            output: node.output,
                            metrics: node.metrics,
                            wait_timeout: self.config.wait_timeout,
                        },
                    ));
                }
                NodeKind::Stage { stage, input } => {
                    let runner = StageRunner::new(input, node.output, node.metrics)
                        .with_wait_timeout(self.config.wait_timeout);
                    match spawn_stage(&self.config, node.name.clone(), runner, stage, exit_tx.clone()) {
                        Ok(handle) => running.workers.push((node.name, handle)),
                        Err(e) => {
                            running.abort();
                            return Err(e);
                        }
                    }
                }
            }
        }

        info!(
            "Pipeline started with {} stage threads and {} sources",
            running.workers.len(),
            running.sources.len()
        );
        Ok(running)
    }
}

/// Outcome reported by a stage thread as it exits
type StageExit = (String, Result<()>);

fn spawn_stage(
    config: &PipelineConfig,
    name: String,
    mut runner: StageRunner,
    stage: Box<dyn Stage>,
    exits: Sender<StageExit>,
) -> Result<JoinHandle<()>> {
    Builder::new()
        .name(config.thread_name(&name))
        .spawn(move || {
            let result = runner.run(stage);
            // drop the ports before reporting so upstream sees the detach first
            drop(runner);
            let _ = exits.send((name, result));
        })
        .map_err(|e| PipelineError::ThreadError(e.to_string()))
}

/// Feeds windows into the head of a running pipeline.
///
/// Dropping the handle ends the stream, so stages never wait on a source
/// that has gone away.
pub struct SourceHandle {
    output: OutputPort,
    metrics: StageMetrics,
    wait_timeout: Option<Duration>,
}

impl SourceHandle {
    pub fn name(&self) -> &str {
        self.output.name()
    }

    pub fn window_size(&self) -> usize {
        self.output.output_window_size()
    }

    /// Write one window, blocking while the slowest consumer catches up
    pub fn write_window(&mut self, window: &[Sample]) -> Result<()> {
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

    /// Split `samples` into whole windows and write each one.
    ///
    /// Returns the number of trailing samples that did not fill a window.
    pub fn write_samples(&mut self, samples: &[Sample]) -> Result<usize> {
        let size = self.window_size();
        let mut chunks = samples.chunks_exact(size);
        for window in chunks.by_ref() {
            self.write_window(window)?;
        }
        Ok(chunks.remainder().len())
    }

    pub fn window_count(&self) -> u64 {
        self.output.window_count()
    }

    /// Switch to `window_size`-sample windows mid-stream.
    ///
    /// Blocks until every consumer has read the windows already written.
    /// Each stage adopts the new size when its first resized window arrives.
    pub fn resize(&mut self, window_size: usize) -> Result<()> {
        let waits = self.output.waits();
        let resized = self.output.resize_when_drained(window_size, self.wait_timeout);
        self.metrics.record_write_waits(self.output.waits() - waits);
        resized?;
        debug!("Source '{}' resized to {}-sample windows", self.name(), window_size);
        Ok(())
    }

    /// End the stream
    pub fn finish(self) {
        debug!("Source '{}' finished", self.name());
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.output.finish();
    }
}

/// A running pipeline that can be waited on or aborted
pub struct RunningPipeline {
    workers: Vec<(String, JoinHandle<()>)>,
    sources: Vec<(NodeId, SourceHandle)>,
    abort_handles: Vec<AbortHandle>,
    metrics: Vec<(String, StageMetrics)>,
    exits: Receiver<StageExit>,
}

impl RunningPipeline {
    /// Take ownership of a source's write handle
    pub fn take_source(&mut self, id: NodeId) -> Option<SourceHandle> {
        let index = self.sources.iter().position(|(node, _)| *node == id)?;
        Some(self.sources.swap_remove(index).1)
    }

    pub fn stage_metrics(&self, name: &str) -> Option<&StageMetrics> {
        self.metrics
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    /// Abort every buffer, waking all blocked stages with `PipelineError::Aborted`
    pub fn abort(&self) {
        warn!("Aborting pipeline");
        for handle in &self.abort_handles {
            handle.abort();
        }
    }

    /// Whether every stage thread has exited
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|(_, handle)| handle.is_finished())
    }

    /// Wait for every stage to finish.
    ///
    /// Sources not taken are finished first. Returns the first stage failure
    /// in the order failures happened.
    pub fn wait(mut self) -> Result<()> {
        self.sources.clear();
        self.join_all()
    }

    /// Like [`wait`](Self::wait), but aborts the pipeline if it has not
    /// finished within `timeout`.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<()> {
        self.sources.clear();
        let deadline = Instant::now() + timeout;
        let mut exited: Vec<StageExit> = Vec::with_capacity(self.workers.len());

        while exited.len() < self.workers.len() {
            match self.exits.recv_deadline(deadline) {
                Ok(exit) => exited.push(exit),
                Err(RecvTimeoutError::Timeout) => {
                    let stalled = self
                        .workers
                        .iter()
                        .map(|(name, _)| name)
                        .find(|name| exited.iter().all(|(done, _)| done != *name))
                        .cloned()
                        .unwrap_or_default();
                    self.abort();
                    let _ = self.join_all();
                    return Err(PipelineError::Timeout { stage: stalled });
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let first_failure = exited.into_iter().find_map(|(_, result)| result.err());
        self.join_threads()?;
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Human-readable metrics for every node
    pub fn metrics_summary(&self) -> String {
        let mut summary = String::from("Pipeline Metrics Summary:\n");
        for (name, metrics) in &self.metrics {
            summary.push_str(&format!("  {}: {}\n", name, metrics.snapshot().format()));
        }
        summary
    }

    fn join_all(&mut self) -> Result<()> {
        self.join_threads()?;
        let first_failure = self.exits.try_iter().find_map(|(_, result)| result.err());
        info!("Pipeline joined");
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn join_threads(&mut self) -> Result<()> {
        let mut panicked = None;
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked.get_or_insert(name);
            }
        }
        match panicked {
            Some(name) => Err(PipelineError::ThreadError(format!(
                "stage '{}' panicked",
                name
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{MeanStage, PassthroughStage};

    #[test]
    fn test_pipeline_builder() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source("samples", 4).unwrap();
        let stage = builder.add_stage(source, PassthroughStage::new(4)).unwrap();
        let _sink = builder.add_sink(stage, "out").unwrap();
        let pipeline = builder.build().unwrap();
        assert_eq!(pipeline.node_names(), vec!["samples", "passthrough"]);
    }

    #[test]
    fn test_no_stages_error() {
        let mut builder = PipelineBuilder::new();
        builder.source("samples", 4).unwrap();
        assert!(matches!(builder.build(), Err(PipelineError::NoStages)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source("samples", 4).unwrap();
        builder.add_stage(source, MeanStage::new(4)).unwrap();
        assert!(matches!(
            builder.add_stage(source, MeanStage::new(4)),
            Err(PipelineError::ConfigError(_))
        ));
    }

    #[test]
    fn test_unknown_upstream() {
        let mut builder = PipelineBuilder::new();
        assert!(matches!(
            builder.add_sink(NodeId(7), "out"),
            Err(PipelineError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected_at_build() {
        let mut builder =
            PipelineBuilder::with_config(PipelineConfig::default().with_buffer_depth(0));
        let source = builder.source("samples", 4).unwrap();
        builder.add_stage(source, MeanStage::new(4)).unwrap();
        assert!(matches!(builder.build(), Err(PipelineError::ConfigError(_))));
    }

    #[test]
    fn test_named_stages_allow_repeated_stage_types() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source("samples", 2).unwrap();
        let first = builder
            .add_named_stage(source, "copy_a", PassthroughStage::new(2))
            .unwrap();
        let second = builder
            .add_named_stage(first, "copy_b", PassthroughStage::new(2))
            .unwrap();
        builder
            .add_named_stage(source, "mean_a", MeanStage::new(2))
            .unwrap();
        builder
            .add_named_stage(source, "mean_b", MeanStage::new(2))
            .unwrap();
        let mut sink = builder.add_sink(second, "out").unwrap();
        let pipeline = builder.build().unwrap();
        assert_eq!(
            pipeline.node_names(),
            vec!["samples", "copy_a", "copy_b", "mean_a", "mean_b"]
        );

        let mut running = pipeline.start().unwrap();
        let mut input = running.take_source(source).unwrap();
        input.write_window(&[1.0, 2.0]).unwrap();
        input.finish();
        assert_eq!(sink.collect_windows(None).unwrap(), vec![vec![1.0, 2.0]]);
        running.wait().unwrap();
    }

    #[test]
    fn test_resize_rejects_size_a_stage_cannot_emit() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source("samples", 4).unwrap();
        let mean = builder.add_stage(source, MeanStage::new(4)).unwrap();
        let sink = builder.add_sink(mean, "out").unwrap();

        assert!(matches!(
            builder.resize(mean, 4),
            Err(PipelineError::ConfigError(_))
        ));
        assert_eq!(sink.required_input_window_size(), 1);
        builder.resize(mean, 1).unwrap();
        // resizing the source is carried into the stage instead
        builder.resize(source, 8).unwrap();
        assert_eq!(sink.required_input_window_size(), 1);
    }

    #[test]
    fn test_resize_propagates_through_passthrough() {
        let mut builder = PipelineBuilder::new();
        let source = builder.source("samples", 4).unwrap();
        let copy = builder.add_stage(source, PassthroughStage::new(4)).unwrap();
        let mut sink = builder.add_sink(copy, "out").unwrap();
        builder.resize(source, 8).unwrap();
        assert_eq!(sink.required_input_window_size(), 8);

        let mut running = builder.build().unwrap().start().unwrap();
        let mut input = running.take_source(source).unwrap();
        input.write_window(&[1.0; 8]).unwrap();
        input.finish();

        assert_eq!(sink.collect_windows(None).unwrap(), vec![vec![1.0; 8]]);
        running.wait().unwrap();
    }
}
