//! Single-producer, multi-consumer synchronized window buffer.
//!
//! A [`SynchronizedBuffer`] wraps one [`RingBuffer`] and gives every
//! registered consumer its own read offset into it. Samples stay in the ring
//! until the slowest consumer has read them, which is what throttles the
//! producer: a lagging consumer never causes another consumer to miss data,
//! it only delays the producer's next write.
//!
//! `read` and `write` never block and report insufficient data or space with
//! `false`. Blocking lives one layer up, in [`InputPort::read_window`] and
//! [`OutputPort::write_window`], which wait on the buffer's condition
//! variable and re-check after every state change.

use crate::error::{PipelineError, Result};
use crate::ring::{RingBuffer, Sample, Window};
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stable index of a consumer slot within one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(usize);

impl ConsumerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct ConsumerSlot {
    name: String,
    /// Samples already read, relative to the ring start
    offset: usize,
    window_size: usize,
    /// Size of the last denied read, cleared once satisfiable
    pending: Option<usize>,
    /// Detached consumers no longer hold back retention
    active: bool,
}

#[derive(Debug)]
struct BufferState {
    ring: RingBuffer,
    /// Producer window size
    unit: usize,
    depth: usize,
    consumers: Vec<ConsumerSlot>,
    window_count: u64,
    eof: bool,
    aborted: bool,
}

impl BufferState {
    /// Largest window either side of the edge moves at once
    fn span(&self) -> usize {
        self.consumers
            .iter()
            .filter(|c| c.active)
            .map(|c| c.window_size)
            .fold(self.unit, usize::max)
    }

    fn reallocate(&mut self) {
        let size = self.depth * self.span();
        self.ring.set_capacity(size);
    }

    fn try_read(&mut self, id: ConsumerId, out: &mut [Sample]) -> bool {
        let offset = match self.consumers.get(id.0) {
            Some(slot) if slot.active => slot.offset,
            _ => return false,
        };
        if !self.ring.get(out, offset) {
            self.consumers[id.0].pending = Some(out.len());
            return false;
        }
        let slot = &mut self.consumers[id.0];
        slot.offset += out.len();
        slot.pending = None;
        self.release_drained();
        true
    }

    fn try_write(&mut self, data: &[Sample]) -> bool {
        if !self.ring.put(data) {
            return false;
        }
        let size = self.ring.size();
        for slot in self.consumers.iter_mut().filter(|c| c.active) {
            if matches!(slot.pending, Some(req) if slot.offset + req <= size) {
                slot.pending = None;
            }
        }
        self.release_drained();
        true
    }

    /// Advance the ring start past everything every active consumer has read.
    fn release_drained(&mut self) {
        let min_offset = self
            .consumers
            .iter()
            .filter(|c| c.active)
            .map(|c| c.offset)
            .min();

        let advance = match min_offset {
            Some(min) => min,
            // every registered consumer detached: nobody will read this data
            None if !self.consumers.is_empty() => self.ring.size(),
            None => 0,
        };
        if advance == 0 {
            return;
        }

        self.ring.advance_start(advance);
        self.window_count += 1;
        for slot in self.consumers.iter_mut().filter(|c| c.active) {
            slot.offset -= advance;
        }
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    state: Mutex<BufferState>,
    changed: Condvar,
}

impl Shared {
    /// Block until notified, or fail once `deadline` has passed.
    fn wait(
        &self,
        state: &mut MutexGuard<'_, BufferState>,
        deadline: Option<Instant>,
        who: &str,
    ) -> Result<()> {
        match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(PipelineError::Timeout {
                        stage: who.to_string(),
                    });
                }
                let _ = self.changed.wait_until(state, deadline);
            }
            None => self.changed.wait(state),
        }
        Ok(())
    }
}

/// Ring buffer shared by one producer and any number of consumers
#[derive(Debug)]
pub struct SynchronizedBuffer {
    shared: Arc<Shared>,
}

impl SynchronizedBuffer {
    /// Create a buffer for `window_size`-sample windows that holds `depth`
    /// windows of the largest size moved across it.
    pub fn new(name: impl Into<String>, window_size: usize, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(BufferState {
                    ring: RingBuffer::new(depth * window_size),
                    unit: window_size,
                    depth,
                    consumers: Vec::new(),
                    window_count: 0,
                    eof: false,
                    aborted: false,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Name of the producer that owns this buffer
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Producer window size
    pub fn window_size(&self) -> usize {
        self.shared.state.lock().unit
    }

    /// Samples the ring can hold
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().ring.capacity() - 1
    }

    /// Samples currently retained
    pub fn occupied(&self) -> usize {
        self.shared.state.lock().ring.size()
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.state.lock().consumers.len()
    }

    /// Add a consumer reading `window_size`-sample windows, starting at the
    /// oldest retained sample.
    ///
    /// Grows the ring when the new consumer reads larger windows than it was
    /// sized for. Growing discards the ring's contents, so it is refused
    /// while samples are buffered.
    pub fn register_consumer(
        &self,
        name: impl Into<String>,
        window_size: usize,
    ) -> Result<InputPort> {
        let name = name.into();
        if window_size == 0 {
            return Err(PipelineError::ConfigError(format!(
                "consumer '{}' requested an empty window",
                name
            )));
        }

        let mut state = self.shared.state.lock();
        let grows = window_size > state.span();
        if grows && !state.ring.is_empty() {
            return Err(PipelineError::ProtocolViolation(format!(
                "consumer '{}' needs a larger ring on '{}' while {} samples are buffered",
                name,
                self.shared.name,
                state.ring.size()
            )));
        }
        state.consumers.push(ConsumerSlot {
            name: name.clone(),
            offset: 0,
            window_size,
            pending: None,
            active: true,
        });
        if grows {
            state.reallocate();
            debug!(
                "Buffer '{}' grown to {} samples for consumer '{}'",
                self.shared.name,
                state.ring.capacity() - 1,
                name
            );
        }
        let id = ConsumerId(state.consumers.len() - 1);
        drop(state);

        debug!(
            "Consumer '{}' registered on '{}' as #{}",
            name,
            self.shared.name,
            id.0
        );
        Ok(InputPort {
            id,
            name,
            shared: Arc::clone(&self.shared),
            waits: 0,
        })
    }

    /// Non-blocking read of `out.len()` samples for consumer `id`.
    ///
    /// Returns `false` for an id this buffer never issued or whose port was
    /// dropped.
    pub fn read(&self, id: ConsumerId, out: &mut [Sample]) -> bool {
        let ok = self.shared.state.lock().try_read(id, out);
        if ok {
            self.shared.changed.notify_all();
        }
        ok
    }

    /// Non-blocking write of one window
    pub fn write(&self, data: &[Sample]) -> bool {
        let ok = self.shared.state.lock().try_write(data);
        if ok {
            self.shared.changed.notify_all();
        }
        ok
    }

    /// Mark the end of the stream. Only the first call wakes consumers.
    pub fn set_eof(&self) {
        let mut state = self.shared.state.lock();
        if state.eof {
            return;
        }
        state.eof = true;
        drop(state);
        debug!("Buffer '{}' reached EOF", self.shared.name);
        self.shared.changed.notify_all();
    }

    pub fn is_eof(&self) -> bool {
        self.shared.state.lock().eof
    }

    /// Number of times the retained range advanced, plus one if `consumer`
    /// has read past the current start.
    pub fn window_count(&self, consumer: Option<ConsumerId>) -> u64 {
        let state = self.shared.state.lock();
        window_count_of(&state, consumer)
    }

    /// Switch the buffer to `window_size`-sample windows for the producer and
    /// every consumer.
    ///
    /// Reallocates the ring, so it is refused while any samples are buffered.
    pub fn resize(&self, window_size: usize) -> Result<()> {
        if window_size == 0 {
            return Err(PipelineError::ConfigError(format!(
                "cannot resize '{}' to an empty window",
                self.shared.name
            )));
        }
        let mut state = self.shared.state.lock();
        if !state.ring.is_empty() {
            return Err(PipelineError::ProtocolViolation(format!(
                "resize of '{}' while {} samples are buffered",
                self.shared.name,
                state.ring.size()
            )));
        }
        state.unit = window_size;
        for slot in state.consumers.iter_mut() {
            slot.window_size = window_size;
            slot.offset = 0;
            slot.pending = None;
        }
        state.reallocate();
        drop(state);

        debug!("Buffer '{}' resized to {}-sample windows", self.shared.name, window_size);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Wake every waiter so it re-checks the buffer
    pub fn notify_consumers(&self) {
        self.shared.changed.notify_all();
    }

    /// Handle that can abort this buffer from another thread
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn abort(&self) {
        self.abort_handle().abort();
    }
}

fn window_count_of(state: &BufferState, consumer: Option<ConsumerId>) -> u64 {
    let partial = consumer
        .and_then(|id| state.consumers.get(id.0))
        .map_or(false, |slot| slot.active && slot.offset > 0);
    state.window_count + u64::from(partial)
}

/// Aborts one buffer, waking every thread blocked on it
#[derive(Debug, Clone)]
pub struct AbortHandle {
    shared: Arc<Shared>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let mut state = self.shared.state.lock();
        if state.aborted {
            return;
        }
        state.aborted = true;
        drop(state);
        self.shared.changed.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.state.lock().aborted
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

/// Consumer side of a buffer edge
///
/// Created by registration. Dropping the port detaches the consumer so it
/// stops holding back the producer.
#[derive(Debug)]
pub struct InputPort {
    id: ConsumerId,
    name: String,
    shared: Arc<Shared>,
    waits: u64,
}

impl InputPort {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the producer feeding this port
    pub fn upstream_name(&self) -> &str {
        &self.shared.name
    }

    /// Window size this consumer currently reads
    pub fn required_input_window_size(&self) -> usize {
        self.shared.state.lock().consumers[self.id.0].window_size
    }

    /// Non-blocking read into `out`
    pub fn read(&self, out: &mut [Sample]) -> bool {
        let ok = self.shared.state.lock().try_read(self.id, out);
        if ok {
            self.shared.changed.notify_all();
        }
        ok
    }

    /// Block until a whole window is available and return it.
    ///
    /// Returns `Ok(None)` once the producer has set EOF and fewer samples
    /// than one window remain.
    pub fn read_window(&mut self, timeout: Option<Duration>) -> Result<Option<Window>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut out = Window::new();
        let mut state = self.shared.state.lock();
        loop {
            if state.aborted {
                return Err(PipelineError::Aborted);
            }
            let size = state.consumers[self.id.0].window_size;
            out.resize(size, 0.0);
            if state.try_read(self.id, &mut out) {
                drop(state);
                self.shared.changed.notify_all();
                return Ok(Some(out));
            }
            if state.eof {
                let slot = &state.consumers[self.id.0];
                let leftover = state.ring.size() - slot.offset;
                if leftover > 0 {
                    debug!(
                        "Consumer '{}' dropped {} trailing samples shorter than a window",
                        self.name, leftover
                    );
                }
                return Ok(None);
            }
            self.waits += 1;
            self.shared.wait(&mut state, deadline, &self.name)?;
        }
    }

    /// Read windows until EOF
    pub fn collect_windows(&mut self, timeout: Option<Duration>) -> Result<Vec<Window>> {
        let mut windows = Vec::new();
        while let Some(window) = self.read_window(timeout)? {
            windows.push(window);
        }
        Ok(windows)
    }

    pub fn window_count(&self) -> u64 {
        let state = self.shared.state.lock();
        window_count_of(&state, Some(self.id))
    }

    pub fn is_eof(&self) -> bool {
        self.shared.state.lock().eof
    }

    /// Times this port blocked waiting for data
    pub fn waits(&self) -> u64 {
        self.waits
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for InputPort {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let slot = &mut state.consumers[self.id.0];
        slot.active = false;
        slot.pending = None;
        slot.offset = 0;
        debug!("Consumer '{}' detached from '{}'", slot.name, self.shared.name);
        state.release_drained();
        drop(state);
        self.shared.changed.notify_all();
    }
}

/// Producer side of a buffer edge
///
/// The buffer is created on the first consumer registration. Until then,
/// written windows have nowhere to go and are discarded.
#[derive(Debug)]
pub struct OutputPort {
    name: String,
    window_size: usize,
    depth: usize,
    window_offset: u64,
    buffer: Option<SynchronizedBuffer>,
    waits: u64,
}

impl OutputPort {
    pub fn new(name: impl Into<String>, window_size: usize, depth: usize) -> Self {
        Self {
            name: name.into(),
            window_size,
            depth,
            window_offset: 0,
            buffer: None,
            waits: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_window_size(&self) -> usize {
        match &self.buffer {
            Some(buffer) => buffer.window_size(),
            None => self.window_size,
        }
    }

    /// Input windows swallowed upstream of this port before its first output
    pub fn window_offset(&self) -> u64 {
        self.window_offset
    }

    pub fn set_window_offset(&mut self, offset: u64) {
        self.window_offset = offset;
    }

    pub fn window_count(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.window_count(None))
    }

    pub fn buffer(&self) -> Option<&SynchronizedBuffer> {
        self.buffer.as_ref()
    }

    pub fn has_consumers(&self) -> bool {
        self.buffer.is_some()
    }

    /// Register a downstream consumer, creating the buffer on first use
    pub fn register_consumer(
        &mut self,
        name: impl Into<String>,
        window_size: usize,
    ) -> Result<InputPort> {
        let buffer = self.buffer.get_or_insert_with(|| {
            SynchronizedBuffer::new(self.name.clone(), self.window_size, self.depth)
        });
        buffer.register_consumer(name, window_size)
    }

    pub fn resize(&mut self, window_size: usize) -> Result<()> {
        match &self.buffer {
            Some(buffer) => buffer.resize(window_size)?,
            None if window_size == 0 => {
                return Err(PipelineError::ConfigError(format!(
                    "cannot resize '{}' to an empty window",
                    self.name
                )))
            }
            None => {}
        }
        self.window_size = window_size;
        Ok(())
    }

    /// Block until every consumer has read what is buffered, then resize.
    ///
    /// This is how a running producer changes window size: nothing is
    /// written while it waits, so the ring stays empty until the resize.
    pub fn resize_when_drained(
        &mut self,
        window_size: usize,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let shared = match &self.buffer {
            Some(buffer) => Arc::clone(&buffer.shared),
            None => return self.resize(window_size),
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = shared.state.lock();
        loop {
            if state.aborted {
                return Err(PipelineError::Aborted);
            }
            if state.ring.is_empty() {
                break;
            }
            self.waits += 1;
            shared.wait(&mut state, deadline, &self.name)?;
        }
        drop(state);
        self.resize(window_size)
    }

    pub fn notify_consumers_ready(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.notify_consumers();
        }
    }

    /// Block until `data` fits, then write it.
    ///
    /// Returns `Ok(false)` when no consumer is registered and the window was
    /// discarded.
    pub fn write_window(&mut self, data: &[Sample], timeout: Option<Duration>) -> Result<bool> {
        let shared = match &self.buffer {
            Some(buffer) => &buffer.shared,
            None => return Ok(false),
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = shared.state.lock();
        loop {
            if state.aborted {
                return Err(PipelineError::Aborted);
            }
            if state.eof {
                return Err(PipelineError::ProtocolViolation(format!(
                    "write to '{}' after EOF",
                    self.name
                )));
            }
            if data.len() != state.unit {
                return Err(PipelineError::WindowSizeMismatch {
                    stage: self.name.clone(),
                    expected: state.unit,
                    actual: data.len(),
                });
            }
            if state.try_write(data) {
                drop(state);
                shared.changed.notify_all();
                return Ok(true);
            }
            self.waits += 1;
            shared.wait(&mut state, deadline, &self.name)?;
        }
    }

    /// Set EOF on the buffer, if one exists
    pub fn finish(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.set_eof();
        }
    }

    /// Times this port blocked waiting for space
    pub fn waits(&self) -> u64 {
        self.waits
    }

    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.buffer.as_ref().map(SynchronizedBuffer::abort_handle)
    }
}
