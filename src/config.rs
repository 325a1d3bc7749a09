//! Pipeline configuration

use crate::error::{PipelineError, Result};
use std::time::Duration;

/// Settings shared by every buffer and stage thread of one pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Windows each buffer holds, sized for the largest window crossing it (default: 2)
    pub buffer_depth: usize,

    /// Upper bound on any single blocking wait (default: none)
    ///
    /// When set, a stage that waits longer than this on its input or output
    /// fails with [`PipelineError::Timeout`] instead of hanging.
    pub wait_timeout: Option<Duration>,

    /// Prefix for stage thread names (default: "stage")
    pub thread_name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_depth: 2,
            wait_timeout: None,
            thread_name_prefix: "stage".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn with_buffer_depth(mut self, depth: usize) -> Self {
        self.buffer_depth = depth;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Check the settings before a pipeline is assembled
    pub fn validate(&self) -> Result<()> {
        if self.buffer_depth < 2 {
            return Err(PipelineError::ConfigError(format!(
                "buffer_depth must be at least 2, got {}",
                self.buffer_depth
            )));
        }
        if self.wait_timeout == Some(Duration::ZERO) {
            return Err(PipelineError::ConfigError(
                "wait_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn thread_name(&self, stage: &str) -> String {
        format!("{}-{}", self.thread_name_prefix, stage)
    }
}
