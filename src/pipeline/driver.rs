//! Pipeline driver: the main streaming loop
//!
//! ```text
//!   Priming ──▶ AwaitingSignal ──▶ DrainingOutput ──┐
//!      ▲                                            │
//!      └───────────────── no EOS ◀──────────────────┘
//!                           │ EOS / cancel
//!                           ▼
//!                       Flushing ──▶ Terminated
//! ```
//!
//! One driver runs one component graph on the calling thread. It primes the
//! input port from the producer, sleeps until a completion callback raises a
//! trigger, dispatches every completed output buffer to the sink, and tops
//! the output back up with free buffers. Upstream components feeding the
//! driven component through connections are started and stopped with it.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::{BufferHeader, Command};
use crate::component::Component;
use crate::config::DriverConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::format_change;
use crate::port::{wait_any, Port, Trigger};

/// Where the driver is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Priming,
    AwaitingSignal,
    DrainingOutput,
    Flushing,
    Terminated,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Idle => "idle",
            DriverState::Priming => "priming",
            DriverState::AwaitingSignal => "awaiting signal",
            DriverState::DrainingOutput => "draining output",
            DriverState::Flushing => "flushing",
            DriverState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

/// Why a run stopped streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    EndOfStream,
    Cancelled,
}

/// Counters for one run
#[derive(Debug, Clone, Default)]
pub struct DriverReport {
    pub buffers_submitted: u64,
    pub buffers_dispatched: u64,
    pub bytes_dispatched: u64,
    pub format_changes: u32,
    pub soft_failures: u64,
    pub termination: Option<Termination>,
    pub elapsed: Duration,
}

/// Drives one component, and anything connected upstream of it
pub struct Driver {
    component: Arc<Component>,
    upstream: Vec<Arc<Component>>,
    config: DriverConfig,
    cancel: CancelToken,
    input_index: usize,
    output_index: usize,
    state: DriverState,
    end_of_data: bool,
    report: DriverReport,
}

impl Driver {
    pub fn new(component: Arc<Component>, config: DriverConfig) -> Self {
        Self {
            component,
            upstream: Vec::new(),
            config,
            cancel: CancelToken::new(),
            input_index: 0,
            output_index: 0,
            state: DriverState::Idle,
            end_of_data: false,
            report: DriverReport::default(),
        }
    }

    /// Also run a component that feeds this one through a connection
    pub fn with_upstream(mut self, component: Arc<Component>) -> Self {
        self.upstream.push(component);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drive output port `index` instead of the first one
    pub fn with_output(mut self, index: usize) -> Self {
        self.output_index = index;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn report(&self) -> &DriverReport {
        &self.report
    }

    /// Stream until end of stream or cancellation, then flush
    ///
    /// Any fatal error tears the whole graph down before it is returned.
    pub fn run(&mut self) -> Result<DriverReport> {
        let started = Instant::now();
        let output = self
            .component
            .output(self.output_index)
            .cloned()
            .ok_or_else(|| PipelineError::NoOutputPort(self.component.name().to_string()))?;
        // A connected input is fed by the upstream stage, not primed here
        let input = self
            .component
            .input(self.input_index)
            .filter(|port| !port.is_connected())
            .cloned();

        tracing::info!("Starting pipeline on {}", self.component.name());
        let streamed = self
            .start()
            .and_then(|()| self.stream(input.as_ref(), &output))
            .and_then(|termination| self.check_faults().map(|()| termination));

        let result = streamed.and_then(|termination| {
            self.report.termination = Some(termination);
            self.set_state(DriverState::Flushing);
            self.flush()
        });
        self.report.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.set_state(DriverState::Terminated);
                tracing::info!(
                    "Pipeline finished ({:?}): {} submitted, {} dispatched ({} bytes), {} format changes, {} soft failures",
                    self.report.termination,
                    self.report.buffers_submitted,
                    self.report.buffers_dispatched,
                    self.report.bytes_dispatched,
                    self.report.format_changes,
                    self.report.soft_failures
                );
                Ok(self.report.clone())
            }
            Err(e) => {
                tracing::error!("Pipeline on {} failed: {}", self.component.name(), e);
                self.teardown();
                self.set_state(DriverState::Terminated);
                Err(e)
            }
        }
    }

    fn set_state(&mut self, state: DriverState) {
        if self.state != state {
            tracing::trace!("Driver {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn start(&mut self) -> Result<()> {
        self.component.start_ports()?;
        self.component.enable()?;
        // Downstream inputs must accept buffers before upstream outputs produce them
        for component in &self.upstream {
            component.start_ports()?;
            component.enable()?;
        }
        Ok(())
    }

    fn stream(&mut self, input: Option<&Port>, output: &Port) -> Result<Termination> {
        loop {
            // A fault wins over a concurrent cancel
            self.check_faults()?;
            if self.cancel.is_cancelled() {
                return Ok(Termination::Cancelled);
            }

            let priming = input.filter(|_| !self.end_of_data);
            if let Some(input) = priming {
                self.set_state(DriverState::Priming);
                self.prime(input)?;
            }

            self.set_state(DriverState::AwaitingSignal);
            if !self.await_signal(input.filter(|_| !self.end_of_data), output)? {
                return Ok(Termination::Cancelled);
            }

            self.set_state(DriverState::DrainingOutput);
            if self.drain_output(output)? {
                return Ok(Termination::EndOfStream);
            }
            if output.is_enabled() {
                output.send_all_free()?;
            }
        }
    }

    /// Fill and submit every free input buffer
    fn prime(&mut self, input: &Port) -> Result<()> {
        while let Some(mut buffer) = input.acquire()? {
            let fill = match input.fill(&mut buffer) {
                Ok(fill) => fill,
                Err(e) => {
                    if let Err(release) = buffer.release() {
                        tracing::warn!("Failed to release input buffer: {}", release);
                    }
                    return Err(PipelineError::ProducerFailed(e.to_string()).into());
                }
            };
            tracing::debug!("Sending {} bytes to {}", fill.bytes_written, input.name());
            input.send(buffer)?;
            self.report.buffers_submitted += 1;

            if fill.end_of_data {
                tracing::info!("Producer for {} reached end of data", input.name());
                self.end_of_data = true;
                break;
            }
        }
        Ok(())
    }

    /// Block until a trigger is raised; false if cancelled first
    ///
    /// Faults recorded by callbacks anywhere in the graph are checked between
    /// wait slices, so a stage that stalls after a failed hand-off still ends
    /// the run.
    fn await_signal(&self, input: Option<&Port>, output: &Port) -> Result<bool> {
        let mut triggers: Vec<&Trigger> = vec![output.trigger()];
        if let Some(input) = input {
            triggers.push(input.trigger());
        }
        let slice = self.config.wake_interval();

        while !wait_any(&triggers, Some(self.cancel.receiver()), slice) {
            self.check_faults()?;
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            tracing::trace!("Awaiting trigger on {}", self.component.name());
        }
        self.check_faults()?;

        tracing::trace!("Resetting trigger state");
        if let Some(input) = self.component.input(self.input_index) {
            input.trigger().reset();
        }
        output.trigger().reset();
        Ok(true)
    }

    /// Dispatch everything in the working queue; true once end of stream is seen
    fn drain_output(&mut self, output: &Port) -> Result<bool> {
        while let Some(buffer) = output.pop() {
            if !buffer.check_state() {
                tracing::warn!("Invalid buffer on {}: {:?}", output.name(), buffer);
                self.report.soft_failures += 1;
                self.discard(buffer);
                break;
            }

            let changed = match buffer.command() {
                Some(Command::FormatChanged(format)) => Some(format.clone()),
                _ => None,
            };
            if let Some(format) = changed {
                format_change::handle(output, buffer, format, self.config.drain_timeout())?;
                self.report.format_changes += 1;
                continue;
            }
            if buffer.is_event() {
                let end = buffer.is_end_of_stream();
                tracing::debug!("Releasing event {:#010x} from {}", buffer.cmd(), output.name());
                self.discard(buffer);
                if end {
                    tracing::info!("Received end of stream event on {}", output.name());
                    return Ok(true);
                }
                continue;
            }

            let end = buffer.is_end_of_stream();
            self.dispatch(output, &buffer);
            // Always released, whatever the sink did with it
            buffer.release()?;

            if end {
                tracing::info!("Received end of stream on {}", output.name());
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn dispatch(&mut self, output: &Port, buffer: &BufferHeader) {
        if buffer.length() == 0 {
            tracing::debug!("Empty buffer on {}", output.name());
            return;
        }
        match output.dispatch(buffer) {
            Ok(()) => {
                self.report.buffers_dispatched += 1;
                self.report.bytes_dispatched += buffer.length() as u64;
            }
            Err(e) => {
                tracing::warn!("Sink for {} failed: {}", output.name(), e);
                self.report.soft_failures += 1;
            }
        }
    }

    fn discard(&self, buffer: BufferHeader) {
        if let Err(e) = buffer.release() {
            tracing::warn!("Failed to release buffer: {}", e);
        }
    }

    fn check_faults(&self) -> Result<()> {
        for component in std::iter::once(&self.component).chain(&self.upstream) {
            let ports = std::iter::once(component.control())
                .chain(component.inputs())
                .chain(component.outputs());
            for port in ports {
                if let Some(fault) = port.take_fault() {
                    return Err(fault);
                }
            }
        }
        Ok(())
    }

    /// Orderly shutdown: ports, then stages, then pools
    fn flush(&mut self) -> Result<()> {
        let timeout = self.config.drain_timeout();
        let graph: Vec<Arc<Component>> = std::iter::once(self.component.clone())
            .chain(self.upstream.iter().cloned())
            .collect();

        let mut first_error = None;
        for component in &graph {
            if let Err(e) = component.stop_ports(timeout) {
                first_error.get_or_insert(e);
            }
        }
        for component in &graph {
            if let Err(e) = component.disable() {
                first_error.get_or_insert(e);
            }
            if let Err(e) = component.clean_port_pools() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn teardown(&self) {
        self.component.teardown();
        for component in &self.upstream {
            component.teardown();
        }
    }
}
