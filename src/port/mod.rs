//! Ports: directional endpoints between a component and the hardware stage
//!
//! A [`Port`] owns the pool negotiated for its format, a working queue of
//! buffers the hardware has handed back, and a [`Trigger`] raised whenever
//! work is pending. The [`PortCallback`] given to the hardware runs on the
//! hardware's threads and does only the bookkeeping needed to hand buffers
//! over to the driver.

pub mod format;
pub mod registry;
pub mod trigger;

pub use format::{Crop, Encoding, PortConfig, PortFormat, Rational, Resolution};
pub use registry::{CallbackRegistry, PortHandler};
pub use trigger::{wait_any, Trigger};

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::buffer::{BufferFlags, BufferHeader, BufferPool, BufferQueue, Command, PoolStats};
use crate::constants::DRAIN_SLICE_MS;
use crate::error::{Error, HandlerError, PipelineError, PoolError, PortError, Result};
use crate::handler::FillResult;
use crate::hardware::{HardwareStage, PortCapabilities, SubmitError};

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Control,
    Input,
    Output,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Control => write!(f, "control"),
            PortKind::Input => write!(f, "input"),
            PortKind::Output => write!(f, "output"),
        }
    }
}

/// Port address within a hardware stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId {
    pub kind: PortKind,
    pub index: usize,
}

impl PortId {
    pub const CONTROL: Self = Self {
        kind: PortKind::Control,
        index: 0,
    };

    pub const fn input(index: usize) -> Self {
        Self {
            kind: PortKind::Input,
            index,
        }
    }

    pub const fn output(index: usize) -> Self {
        Self {
            kind: PortKind::Output,
            index,
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PortKind::Control => write!(f, "control"),
            kind => write!(f, "{}:{}", kind, self.index),
        }
    }
}

struct PortState {
    format: PortFormat,
    committed: bool,
    pool: Option<Arc<BufferPool>>,
    handler: PortHandler,
    /// Output feeding this input through a connection
    upstream: Weak<PortInner>,
    /// Input this output forwards into through a connection
    downstream: Option<Port>,
}

struct PortInner {
    id: PortId,
    guid: Uuid,
    name: String,
    hardware: Arc<dyn HardwareStage>,
    registry: Arc<CallbackRegistry>,
    enabled: AtomicBool,
    trigger: Trigger,
    working: BufferQueue,
    state: RwLock<PortState>,
    fault: Mutex<Option<Error>>,
    completions: AtomicU64,
    forwarded: AtomicU64,
}

/// Shared handle to one port
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    pub(crate) fn new(
        component: &str,
        id: PortId,
        hardware: Arc<dyn HardwareStage>,
        registry: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id,
                guid: Uuid::new_v4(),
                name: format!("{}/{}", component, id),
                hardware,
                registry,
                enabled: AtomicBool::new(false),
                trigger: Trigger::new(),
                working: BufferQueue::new(),
                state: RwLock::new(PortState {
                    format: PortFormat::default(),
                    committed: false,
                    pool: None,
                    handler: PortHandler::Default,
                    upstream: Weak::new(),
                    downstream: None,
                }),
                fault: Mutex::new(None),
                completions: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> PortId {
        self.inner.id
    }

    pub fn kind(&self) -> PortKind {
        self.inner.id.kind
    }

    /// Key under which handlers are registered for this port
    pub fn guid(&self) -> Uuid {
        self.inner.guid
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) -> &Trigger {
        &self.inner.trigger
    }

    /// Current negotiated format
    pub fn format(&self) -> PortFormat {
        self.inner.state.read().format.clone()
    }

    pub fn is_committed(&self) -> bool {
        self.inner.state.read().committed
    }

    pub fn pool(&self) -> Option<Arc<BufferPool>> {
        self.inner.state.read().pool.clone()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool().map(|pool| pool.stats())
    }

    /// Handler resolved from the registry when the port was last configured or enabled
    pub fn handler(&self) -> PortHandler {
        self.inner.state.read().handler.clone()
    }

    /// Whether a connection feeds (input) or drains (output) this port
    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.read();
        match self.kind() {
            PortKind::Input => state.upstream.strong_count() > 0,
            PortKind::Output => state.downstream.is_some(),
            PortKind::Control => false,
        }
    }

    /// Buffers waiting in the working queue
    pub fn working_len(&self) -> usize {
        self.inner.working.len()
    }

    /// Completion callbacks received so far
    pub fn completion_count(&self) -> u64 {
        self.inner.completions.load(Ordering::Relaxed)
    }

    /// Buffers handed across a connection from this output
    pub fn forwarded_count(&self) -> u64 {
        self.inner.forwarded.load(Ordering::Relaxed)
    }

    /// Negotiate a format and build the pool for it
    ///
    /// Buffer count and size become `max(recommended, minimum)` as reported
    /// by the hardware after commit, unless the configuration overrides them.
    /// Overrides below the hardware minimum are raised to it.
    pub fn configure(&self, config: &PortConfig) -> Result<PortFormat> {
        if self.kind() == PortKind::Control {
            return Err(PortError::WrongKind {
                port: self.name().to_string(),
                expected: "data".to_string(),
            }
            .into());
        }
        let requested = config.apply_to(&self.format())?;
        let caps = self.commit(requested)?;
        let (num, size) = caps.negotiate(config.buffer_num, config.buffer_size);
        self.create_pool(num, size)?;

        let handler = self.inner.registry.find(&self.guid());
        let format = {
            let mut state = self.inner.state.write();
            state.handler = handler;
            state.format.clone()
        };
        tracing::info!(
            "Configured {}: {} ({} x {} bytes, recommended {} x {}, minimum {} x {})",
            self.name(),
            format,
            num,
            size,
            caps.buffer_num_recommended,
            caps.buffer_size_recommended,
            caps.buffer_num_min,
            caps.buffer_size_min
        );
        Ok(format)
    }

    /// Commit `format` to the hardware and read back the buffer limits
    pub(crate) fn commit(&self, mut format: PortFormat) -> Result<PortCapabilities> {
        if self.is_enabled() {
            return Err(PortError::FormatWhileEnabled(self.name().to_string()).into());
        }
        self.inner.hardware.commit(&self.id(), &format)?;
        let caps = self.inner.hardware.capabilities(&self.id())?;
        format.buffer_num = caps.buffer_num();
        format.buffer_size = caps.buffer_size();

        let mut state = self.inner.state.write();
        state.format = format;
        state.committed = true;
        Ok(caps)
    }

    /// Allocate the pool, or rebuild the existing one, with the given dimensions
    pub(crate) fn create_pool(&self, buffer_num: usize, buffer_size: usize) -> Result<PoolStats> {
        if self.is_enabled() {
            return Err(PortError::FormatWhileEnabled(self.name().to_string()).into());
        }
        let existing = self.pool();
        let pool = match existing {
            Some(pool) => {
                pool.resize(buffer_num, buffer_size)?;
                pool
            }
            None => BufferPool::new(self.name(), buffer_num, buffer_size)?,
        };
        let stats = pool.stats();

        let mut state = self.inner.state.write();
        state.format.buffer_num = buffer_num;
        state.format.buffer_size = buffer_size;
        state.pool = Some(pool);
        Ok(stats)
    }

    /// Free the pool; fails while any buffer is outstanding
    pub fn destroy_pool(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        if let Some(pool) = state.pool.as_ref() {
            pool.destroy()?;
            tracing::debug!("Released pool of {}", self.name());
        }
        state.pool = None;
        Ok(())
    }

    /// Start accepting completions from the hardware
    ///
    /// Data ports need a committed format and a pool first. An input fed by a
    /// connection uses the upstream pool and needs none of its own.
    pub fn enable(&self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }
        if self.kind() != PortKind::Control {
            let state = self.inner.state.read();
            if !state.committed {
                return Err(PortError::NotCommitted(self.name().to_string()).into());
            }
            let fed_by_connection = self.kind() == PortKind::Input && state.upstream.strong_count() > 0;
            if state.pool.is_none() && !fed_by_connection {
                return Err(PortError::NoPool(self.name().to_string()).into());
            }
        }

        let handler = self.inner.registry.find(&self.guid());
        let handler_name = handler.name().to_string();
        self.inner.state.write().handler = handler;

        self.inner.enabled.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.hardware.enable_port(&self.id(), self.callback()) {
            self.inner.enabled.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        tracing::info!("Enabled port {} (handler: {})", self.name(), handler_name);
        Ok(())
    }

    /// Stop the port on the hardware without waiting for buffers to return
    pub(crate) fn stop(&self) -> Result<()> {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.hardware.disable_port(&self.id())?;
        self.inner.trigger.reset();
        tracing::info!("Disabled port {}", self.name());
        Ok(())
    }

    /// Disable the port and wait for every outstanding buffer to come back
    ///
    /// Returns the number of buffers released from the working queue.
    pub fn disable(&self, drain_timeout: Option<Duration>) -> Result<usize> {
        self.stop()?;
        self.drain(drain_timeout)
    }

    /// Release everything in the working queue until the pool is full again
    ///
    /// Blocks until all buffers are home. With a timeout, a drain that does
    /// not finish in time fails with [`PipelineError::DrainTimeout`].
    pub fn drain(&self, timeout: Option<Duration>) -> Result<usize> {
        let Some(pool) = self.pool() else {
            return Ok(0);
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let slice = Duration::from_millis(DRAIN_SLICE_MS);
        let mut released = 0;

        loop {
            while let Some(buffer) = self.inner.working.try_pop() {
                self.release_returned(buffer);
                released += 1;
            }
            if pool.is_full() {
                tracing::debug!("Drained {}: {} buffers released", self.name(), released);
                return Ok(released);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(PipelineError::DrainTimeout {
                    port: self.name().to_string(),
                    outstanding: pool.stats().outstanding(),
                }
                .into());
            }
            if let Some(buffer) = self.inner.working.pop_timeout(slice) {
                self.release_returned(buffer);
                released += 1;
            }
        }
    }

    /// Take a free buffer from the pool
    ///
    /// `Ok(None)` means every buffer is outstanding.
    pub fn acquire(&self) -> Result<Option<BufferHeader>> {
        let pool = self
            .pool()
            .ok_or_else(|| PortError::NoPool(self.name().to_string()))?;
        Ok(pool.acquire())
    }

    /// Hand a buffer to the hardware
    ///
    /// On a refused submission the buffer goes back to its pool and the
    /// hardware error is returned.
    pub fn send(&self, buffer: BufferHeader) -> Result<()> {
        let pool = self.submittable(&buffer)?;
        pool.mark_in_flight(&buffer)?;
        self.submit(&pool, buffer)
    }

    fn submittable(&self, buffer: &BufferHeader) -> Result<Arc<BufferPool>> {
        if buffer.is_event() {
            return Err(PipelineError::Protocol(format!("event buffer sent to {}", self.name())).into());
        }
        buffer.origin().ok_or_else(|| {
            PipelineError::Protocol(format!("buffer without a pool sent to {}", self.name())).into()
        })
    }

    fn submit(&self, pool: &BufferPool, buffer: BufferHeader) -> Result<()> {
        match self.inner.hardware.submit(&self.id(), buffer) {
            Ok(()) => Ok(()),
            Err(SubmitError { error, buffer }) => {
                if let Err(e) = pool.mark_completed(&buffer).and_then(|_| pool.release(buffer)) {
                    tracing::warn!("Failed to reclaim refused buffer on {}: {}", self.name(), e);
                }
                Err(error)
            }
        }
    }

    /// Send every free buffer in the pool to the hardware
    pub fn send_all_free(&self) -> Result<usize> {
        let Some(pool) = self.pool() else {
            return Ok(0);
        };
        let mut sent = 0;
        while let Some(buffer) = pool.acquire() {
            self.send(buffer)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Next completed buffer from the working queue
    pub fn pop(&self) -> Option<BufferHeader> {
        self.inner.working.try_pop()
    }

    /// Ask the port's producer to fill `buffer`
    ///
    /// The buffer length is set from the result, and END_OF_STREAM is flagged
    /// once the producer runs out of data.
    pub fn fill(&self, buffer: &mut BufferHeader) -> std::result::Result<FillResult, HandlerError> {
        let result = match self.handler() {
            PortHandler::Registered(handler) => handler.fill(buffer.as_mut_slice())?,
            PortHandler::Default => FillResult::end(0),
        };
        buffer.set_length(result.bytes_written);
        if result.end_of_data {
            buffer.insert_flags(BufferFlags::END_OF_STREAM);
        }
        Ok(result)
    }

    /// Give a finished buffer to the port's sink
    pub fn dispatch(&self, buffer: &BufferHeader) -> std::result::Result<(), HandlerError> {
        match self.handler() {
            PortHandler::Registered(handler) => handler.consume(buffer),
            PortHandler::Default => {
                tracing::trace!("No sink on {}, discarding {} bytes", self.name(), buffer.length());
                Ok(())
            }
        }
    }

    /// First fatal error seen by a completion callback, if any
    ///
    /// Covers protocol violations and hardware refusals while handing a
    /// buffer on through a connection.
    pub fn take_fault(&self) -> Option<Error> {
        self.inner.fault.lock().take()
    }

    pub(crate) fn callback(&self) -> PortCallback {
        PortCallback {
            port: Arc::downgrade(&self.inner),
            id: self.id(),
        }
    }

    pub(crate) fn link(output: &Port, input: &Port) {
        output.inner.state.write().downstream = Some(input.clone());
        input.inner.state.write().upstream = Arc::downgrade(&output.inner);
    }

    pub(crate) fn unlink(output: &Port, input: &Port) {
        output.inner.state.write().downstream = None;
        input.inner.state.write().upstream = Weak::new();
    }

    pub(crate) fn is_same(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Submit a buffer completed on this output to a downstream input
    pub(crate) fn forward(&self, downstream: &Port, buffer: BufferHeader) -> Result<()> {
        let pool = downstream.submittable(&buffer)?;
        pool.mark_forwarded(&buffer)?;
        downstream.submit(&pool, buffer)?;
        self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release_returned(&self, buffer: BufferHeader) {
        if let Err(e) = buffer.release() {
            tracing::warn!("Discarding buffer returned to {}: {}", self.name(), e);
        }
    }

    fn record_fault(&self, error: impl Into<Error>) {
        let error = error.into();
        tracing::error!("Fault on {}: {}", self.name(), error);
        let mut fault = self.inner.fault.lock();
        if fault.is_none() {
            *fault = Some(error);
        }
        drop(fault);
        self.inner.trigger.set();
    }

    fn on_control(&self, buffer: BufferHeader) {
        tracing::debug!("Control event {:#010x} on {}", buffer.cmd(), self.name());
        if let Some(Command::Error(code)) = buffer.command() {
            tracing::warn!("Hardware reported error {} on {}", code, self.name());
        }
        if let PortHandler::Registered(handler) = self.handler() {
            if let Err(e) = handler.consume(&buffer) {
                tracing::warn!("Control handler {} failed: {}", handler.name(), e);
            }
        }
        if let Err(e) = reclaim(buffer) {
            self.record_fault(e);
        }
    }

    fn on_input(&self, buffer: BufferHeader) {
        if let Err(e) = reclaim(buffer) {
            self.record_fault(e);
        }
        let upstream = self.inner.state.read().upstream.upgrade();
        if let Some(upstream) = upstream.map(|inner| Port { inner }) {
            // Buffer went home to the upstream pool; give the upstream stage
            // something to write into again
            if upstream.is_enabled() {
                if let Err(e) = upstream.send_all_free() {
                    tracing::error!("Failed to refill {}", upstream.name());
                    self.record_fault(e);
                }
            }
        }
        self.inner.trigger.set();
    }

    fn on_output(&self, buffer: BufferHeader) {
        if !buffer.check_state() {
            tracing::warn!("Invalid buffer returned on {}: {:?}", self.name(), buffer);
            if let Err(e) = reclaim(buffer) {
                self.record_fault(e);
            }
            return;
        }
        if let Some(pool) = buffer.origin() {
            if let Err(e) = pool.mark_completed(&buffer) {
                self.record_fault(e);
                return;
            }
        }

        let enabled = self.is_enabled();
        if enabled && !buffer.is_event() {
            let downstream = self.inner.state.read().downstream.clone();
            if let Some(downstream) = downstream {
                if let Err(e) = self.forward(&downstream, buffer) {
                    if downstream.is_enabled() {
                        tracing::error!("Failed to forward {} -> {}", self.name(), downstream.name());
                        self.record_fault(e);
                    } else {
                        // Downstream is shutting down; the refused buffer is already home
                        tracing::debug!("Dropped hand-off to disabled {}: {}", downstream.name(), e);
                    }
                }
                return;
            }
        }

        self.inner.working.push(buffer);
        if enabled {
            self.inner.trigger.set();
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.inner.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Hand an in-flight buffer back to its pool
fn reclaim(buffer: BufferHeader) -> std::result::Result<(), PoolError> {
    match buffer.origin() {
        Some(pool) => {
            pool.mark_completed(&buffer)?;
            pool.release(buffer)
        }
        None => Ok(()),
    }
}

/// Completion entry point handed to the hardware for one port
///
/// Cheap to clone; holds only a weak reference to the port, so a stage that
/// outlives its ports simply has its late completions reclaimed.
#[derive(Clone)]
pub struct PortCallback {
    port: Weak<PortInner>,
    id: PortId,
}

impl PortCallback {
    pub fn port_id(&self) -> PortId {
        self.id
    }

    /// Return `buffer` from the hardware
    pub fn complete(&self, buffer: BufferHeader) {
        let Some(port) = self.port.upgrade().map(|inner| Port { inner }) else {
            tracing::debug!("Completion for dropped port {}", self.id);
            if let Err(e) = reclaim(buffer) {
                tracing::warn!("Failed to reclaim buffer for dropped port {}: {}", self.id, e);
            }
            return;
        };
        port.inner.completions.fetch_add(1, Ordering::Relaxed);
        match self.id.kind {
            PortKind::Control => port.on_control(buffer),
            PortKind::Input => port.on_input(buffer),
            PortKind::Output => port.on_output(buffer),
        }
    }
}

impl fmt::Debug for PortCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortCallback({})", self.id)
    }
}
