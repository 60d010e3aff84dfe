//! Software stand-in for a hardware stage
//!
//! Runs its own worker thread and completes buffers from it, so callbacks
//! arrive asynchronously exactly as they would from an accelerator. Two
//! shapes are supported:
//!
//! - passthrough (one input, one output): copies input payloads into output
//!   buffers, splitting them when an output buffer is smaller
//! - source (no input, one output): emits synthetic frames at a fixed
//!   interval, like a camera
//!
//! It can also be told to change its output format after a number of
//! buffers, or to start refusing submissions, to exercise those paths.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::buffer::{BufferFlags, BufferHeader, Command};
use crate::error::HardwareError;
use crate::hardware::{HardwareStage, PortCapabilities, SubmitError};
use crate::port::{Encoding, PortCallback, PortFormat, PortId, PortKind};

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Synthetic frame generation for source stages
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Frames to emit before END_OF_STREAM; `None` runs until disabled
    pub frames: Option<usize>,
    pub frame_size: usize,
    pub interval: Duration,
    pub keyframe_interval: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            frames: None,
            frame_size: 4096,
            interval: Duration::from_millis(33),
            keyframe_interval: 30,
        }
    }
}

/// Mid-stream output format change
#[derive(Debug, Clone)]
pub struct FormatChange {
    /// Output buffers emitted before the change
    pub after: usize,
    pub format: PortFormat,
}

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub buffer_num: usize,
    pub buffer_num_min: usize,
    pub buffer_size_min: usize,
    pub source: Option<SourceConfig>,
    pub format_change: Option<FormatChange>,
    /// Refuse every submission after this many
    pub fail_submit_after: Option<usize>,
    /// Refuse input submissions after this many
    pub fail_input_after: Option<usize>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            buffer_num: 3,
            buffer_num_min: 1,
            buffer_size_min: 4096,
            source: None,
            format_change: None,
            fail_submit_after: None,
            fail_input_after: None,
        }
    }
}

impl LoopbackConfig {
    pub fn with_buffers(mut self, recommended: usize, minimum: usize) -> Self {
        self.buffer_num = recommended;
        self.buffer_num_min = minimum;
        self
    }

    pub fn with_buffer_size_min(mut self, size: usize) -> Self {
        self.buffer_size_min = size;
        self
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_format_change(mut self, after: usize, format: PortFormat) -> Self {
        self.format_change = Some(FormatChange { after, format });
        self
    }

    pub fn with_submit_failure(mut self, after: usize) -> Self {
        self.fail_submit_after = Some(after);
        self
    }

    pub fn with_input_failure(mut self, after: usize) -> Self {
        self.fail_input_after = Some(after);
        self
    }
}

struct PortSlot {
    format: PortFormat,
    callback: Option<PortCallback>,
    enabled: bool,
}

impl PortSlot {
    fn new() -> Self {
        Self {
            format: PortFormat::default(),
            callback: None,
            enabled: false,
        }
    }
}

struct StageState {
    running: bool,
    enabled: bool,
    ports: HashMap<PortId, PortSlot>,
    pending_input: VecDeque<BufferHeader>,
    input_consumed: usize,
    free_output: VecDeque<BufferHeader>,
    submitted: usize,
    inputs_submitted: usize,
    emitted: usize,
    format_changed: bool,
    reconfiguring: bool,
    frames: usize,
    eos_sent: bool,
    last_frame: Option<Instant>,
}

type Completion = (PortCallback, BufferHeader);

struct Shared {
    name: String,
    config: LoopbackConfig,
    inputs: usize,
    state: Mutex<StageState>,
    wake: Condvar,
}

/// Threaded software stage implementing [`HardwareStage`]
pub struct LoopbackStage {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackStage {
    /// Start a stage and its worker thread
    pub fn new(name: impl Into<String>, config: LoopbackConfig) -> Result<Arc<Self>, HardwareError> {
        let name = name.into();
        let inputs = if config.source.is_some() { 0 } else { 1 };

        let mut ports = HashMap::new();
        ports.insert(PortId::CONTROL, PortSlot::new());
        for index in 0..inputs {
            ports.insert(PortId::input(index), PortSlot::new());
        }
        ports.insert(PortId::output(0), PortSlot::new());

        let shared = Arc::new(Shared {
            name: name.clone(),
            config,
            inputs,
            state: Mutex::new(StageState {
                running: true,
                enabled: false,
                ports,
                pending_input: VecDeque::new(),
                input_consumed: 0,
                free_output: VecDeque::new(),
                submitted: 0,
                inputs_submitted: 0,
                emitted: 0,
                format_changed: false,
                reconfiguring: false,
                frames: 0,
                eos_sent: false,
                last_frame: None,
            }),
            wake: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("loopback-{}", name))
            .spawn(move || worker_shared.run())
            .map_err(|e| HardwareError::Status {
                code: -1,
                context: format!("spawn worker: {}", e),
            })?;

        tracing::debug!("Started loopback stage {}", name);
        Ok(Arc::new(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }))
    }

    /// Buffers submitted so far
    pub fn submitted(&self) -> usize {
        self.shared.state.lock().submitted
    }

    /// Output buffers completed so far
    pub fn emitted(&self) -> usize {
        self.shared.state.lock().emitted
    }

    /// Input and output buffers currently held by the stage
    pub fn held(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.pending_input.len(), state.free_output.len())
    }

    /// Report an error event on the control port
    pub fn raise_error(&self, code: i32) {
        let callback = self
            .shared
            .state
            .lock()
            .ports
            .get(&PortId::CONTROL)
            .filter(|slot| slot.enabled)
            .and_then(|slot| slot.callback.clone());
        match callback {
            Some(callback) => callback.complete(BufferHeader::event(Command::Error(code))),
            None => tracing::debug!("Control port of {} disabled, dropping error {}", self.shared.name, code),
        }
    }

    /// Stop the worker thread
    pub fn stop(&self) {
        self.shared.state.lock().running = false;
        self.shared.wake.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            // The last reference can be dropped from inside a completion
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("Loopback worker {} panicked", self.shared.name);
            }
        }
    }

    fn slot_mut<'a>(
        state: &'a mut StageState,
        port: &PortId,
    ) -> Result<&'a mut PortSlot, HardwareError> {
        state
            .ports
            .get_mut(port)
            .ok_or_else(|| HardwareError::UnknownPort(port.to_string()))
    }
}

impl HardwareStage for LoopbackStage {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn input_count(&self) -> usize {
        self.shared.inputs
    }

    fn output_count(&self) -> usize {
        1
    }

    fn capabilities(&self, port: &PortId) -> Result<PortCapabilities, HardwareError> {
        let mut state = self.shared.state.lock();
        let slot = Self::slot_mut(&mut state, port)?;
        let config = &self.shared.config;
        Ok(PortCapabilities {
            buffer_num_min: config.buffer_num_min,
            buffer_num_recommended: config.buffer_num,
            buffer_size_min: config.buffer_size_min,
            buffer_size_recommended: frame_bytes(&slot.format),
        })
    }

    fn commit(&self, port: &PortId, format: &PortFormat) -> Result<(), HardwareError> {
        let mut state = self.shared.state.lock();
        let slot = Self::slot_mut(&mut state, port)?;
        if slot.enabled {
            return Err(HardwareError::Status {
                code: -16,
                context: format!("commit on enabled port {}", port),
            });
        }
        slot.format = format.clone();
        tracing::debug!("{} committed {} on {}", self.shared.name, format, port);
        Ok(())
    }

    fn enable_port(&self, port: &PortId, callback: PortCallback) -> Result<(), HardwareError> {
        let mut state = self.shared.state.lock();
        let slot = Self::slot_mut(&mut state, port)?;
        slot.callback = Some(callback);
        slot.enabled = true;
        if port.kind == PortKind::Output {
            state.reconfiguring = false;
        }
        drop(state);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn disable_port(&self, port: &PortId) -> Result<(), HardwareError> {
        let mut state = self.shared.state.lock();
        let slot = Self::slot_mut(&mut state, port)?;
        slot.enabled = false;
        let callback = slot.callback.clone();

        let held: Vec<BufferHeader> = match port.kind {
            PortKind::Input => {
                state.input_consumed = 0;
                state.pending_input.drain(..).collect()
            }
            PortKind::Output => state.free_output.drain(..).collect(),
            PortKind::Control => Vec::new(),
        };
        drop(state);

        if let Some(callback) = callback {
            for buffer in held {
                callback.complete(buffer);
            }
        }
        Ok(())
    }

    fn submit(&self, port: &PortId, buffer: BufferHeader) -> Result<(), SubmitError> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(SubmitError::new(HardwareError::WorkerStopped, buffer));
        }
        let enabled = state.ports.get(port).map(|slot| slot.enabled);
        match enabled {
            None => return Err(SubmitError::new(HardwareError::UnknownPort(port.to_string()), buffer)),
            Some(false) => return Err(SubmitError::new(HardwareError::Disabled(port.to_string()), buffer)),
            Some(true) => {}
        }
        let config = &self.shared.config;
        let refused = config.fail_submit_after.is_some_and(|limit| state.submitted >= limit)
            || (port.kind == PortKind::Input
                && config.fail_input_after.is_some_and(|limit| state.inputs_submitted >= limit));
        if refused {
            let error = HardwareError::Status {
                code: -5,
                context: format!("submit to {}", port),
            };
            return Err(SubmitError::new(error, buffer));
        }

        state.submitted += 1;
        if port.kind == PortKind::Input {
            state.inputs_submitted += 1;
        }
        match port.kind {
            PortKind::Input => state.pending_input.push_back(buffer),
            PortKind::Output => state.free_output.push_back(buffer),
            PortKind::Control => {
                drop(state);
                return Err(SubmitError::new(HardwareError::UnknownPort(port.to_string()), buffer));
            }
        }
        drop(state);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn enable(&self) -> Result<(), HardwareError> {
        self.shared.state.lock().enabled = true;
        self.shared.wake.notify_all();
        tracing::debug!("Enabled stage {}", self.shared.name);
        Ok(())
    }

    fn disable(&self) -> Result<(), HardwareError> {
        self.shared.state.lock().enabled = false;
        tracing::debug!("Disabled stage {}", self.shared.name);
        Ok(())
    }
}

impl Drop for LoopbackStage {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        let mut state = self.state.lock();
        while state.running {
            let completions = if state.enabled {
                self.step(&mut state)
            } else {
                Vec::new()
            };

            if completions.is_empty() {
                let wait = self.idle_wait(&state);
                self.wake.wait_for(&mut state, wait);
                continue;
            }

            MutexGuard::unlocked(&mut state, || {
                for (callback, buffer) in completions {
                    callback.complete(buffer);
                }
            });
        }
        tracing::debug!("Loopback worker {} stopped", self.name);
    }

    fn idle_wait(&self, state: &StageState) -> Duration {
        match (&self.config.source, state.last_frame) {
            (Some(source), Some(last)) => source.interval.saturating_sub(last.elapsed()).max(Duration::from_millis(1)),
            _ => IDLE_WAIT,
        }
    }

    fn callback(state: &StageState, port: PortId) -> Option<PortCallback> {
        state
            .ports
            .get(&port)
            .filter(|slot| slot.enabled)
            .and_then(|slot| slot.callback.clone())
    }

    fn step(&self, state: &mut StageState) -> Vec<Completion> {
        let mut completions = Vec::new();
        if state.reconfiguring {
            return completions;
        }
        let Some(output) = Self::callback(state, PortId::output(0)) else {
            return completions;
        };

        if let Some(change) = &self.config.format_change {
            if !state.format_changed && state.emitted >= change.after {
                state.format_changed = true;
                state.reconfiguring = true;
                tracing::info!("{} changing output format to {}", self.name, change.format);
                completions.push((
                    output,
                    BufferHeader::event(Command::FormatChanged(change.format.clone())),
                ));
                return completions;
            }
        }

        match &self.config.source {
            Some(source) => self.produce(state, source, output, &mut completions),
            None => self.pass_through(state, output, &mut completions),
        }
        completions
    }

    fn produce(
        &self,
        state: &mut StageState,
        source: &SourceConfig,
        output: PortCallback,
        completions: &mut Vec<Completion>,
    ) {
        if state.eos_sent || state.last_frame.is_some_and(|last| last.elapsed() < source.interval) {
            return;
        }
        let Some(mut buffer) = state.free_output.pop_front() else {
            return;
        };

        let fill = (state.frames % 251) as u8;
        let frame = vec![fill; source.frame_size.min(buffer.capacity())];
        buffer.write(&frame);

        let mut flags = BufferFlags::FRAME;
        if state.frames % source.keyframe_interval.max(1) == 0 {
            flags |= BufferFlags::KEYFRAME;
        }
        buffer.set_pts(Some(state.frames as i64 * source.interval.as_micros() as i64));
        state.frames += 1;
        if source.frames.is_some_and(|total| state.frames >= total) {
            flags |= BufferFlags::END_OF_STREAM;
            state.eos_sent = true;
            tracing::debug!("{} emitting end of stream after {} frames", self.name, state.frames);
        }
        buffer.set_flags(flags);

        state.last_frame = Some(Instant::now());
        state.emitted += 1;
        completions.push((output, buffer));
    }

    fn pass_through(&self, state: &mut StageState, output: PortCallback, completions: &mut Vec<Completion>) {
        let Some(input) = Self::callback(state, PortId::input(0)) else {
            return;
        };

        while let Some(front) = state.pending_input.front() {
            if front.length() == 0 && !front.is_end_of_stream() {
                if let Some(done) = state.pending_input.pop_front() {
                    completions.push((input.clone(), done));
                }
                continue;
            }
            let Some(mut out) = state.free_output.pop_front() else {
                break;
            };

            let start = state.input_consumed;
            let remaining = &front.data()[start..];
            let n = out.write(remaining);
            let done = start + n >= front.length();

            let mut flags = front.flags();
            if start > 0 {
                flags.remove(BufferFlags::FRAME_START);
            }
            if !done {
                flags.remove(BufferFlags::FRAME_END);
                flags.remove(BufferFlags::END_OF_STREAM);
            }
            out.set_flags(flags);
            out.set_pts(front.pts());

            state.emitted += 1;
            completions.push((output.clone(), out));

            if done {
                state.input_consumed = 0;
                if let Some(done) = state.pending_input.pop_front() {
                    completions.push((input.clone(), done));
                }
            } else {
                state.input_consumed = start + n;
            }
        }
    }
}

/// Uncompressed frame size for a format; zero when unknown or compressed
pub fn frame_bytes(format: &PortFormat) -> usize {
    let pixels = format.resolution.width as usize * format.resolution.height as usize;
    match format.encoding {
        Encoding::I420 | Encoding::YV12 | Encoding::NV12 => pixels * 3 / 2,
        Encoding::RGB24 | Encoding::BGR24 => pixels * 3,
        Encoding::RGBA => pixels * 4,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Resolution;

    #[test]
    fn test_frame_bytes() {
        let format = PortFormat::new(Encoding::I420, Resolution::new(64, 32));
        assert_eq!(frame_bytes(&format), 64 * 32 * 3 / 2);
        let format = PortFormat::new(Encoding::H264, Resolution::new(64, 32));
        assert_eq!(frame_bytes(&format), 0);
    }

    #[test]
    fn test_capabilities_follow_committed_format() {
        let stage = LoopbackStage::new("caps", LoopbackConfig::default().with_buffer_size_min(1024)).unwrap();
        let port = PortId::output(0);
        stage
            .commit(&port, &PortFormat::new(Encoding::RGB24, Resolution::new(32, 16)))
            .unwrap();
        let caps = stage.capabilities(&port).unwrap();
        assert_eq!(caps.buffer_size_recommended, 32 * 16 * 3);
        assert_eq!(caps.buffer_size(), 32 * 16 * 3);
        assert_eq!(caps.buffer_num(), 3);
    }

    #[test]
    fn test_unknown_port() {
        let stage = LoopbackStage::new("ports", LoopbackConfig::default().with_source(SourceConfig::default())).unwrap();
        assert_eq!(stage.input_count(), 0);
        assert!(matches!(
            stage.capabilities(&PortId::input(0)),
            Err(HardwareError::UnknownPort(_))
        ));
    }

    #[test]
    fn test_submit_to_disabled_port_returns_buffer() {
        let stage = LoopbackStage::new("disabled", LoopbackConfig::default()).unwrap();
        let event = BufferHeader::event(Command::EndOfStream);
        let err = stage.submit(&PortId::input(0), event).unwrap_err();
        assert!(matches!(err.error, crate::error::Error::Hardware(HardwareError::Disabled(_))));
        assert!(err.buffer.is_event());
    }

    #[test]
    fn test_input_refused_after_limit() {
        let stage = LoopbackStage::new("refuse", LoopbackConfig::default().with_input_failure(0)).unwrap();
        let port = PortId::input(0);
        stage.shared.state.lock().ports.get_mut(&port).unwrap().enabled = true;

        let err = stage.submit(&port, BufferHeader::event(Command::EndOfStream)).unwrap_err();
        assert!(matches!(
            err.error,
            crate::error::Error::Hardware(HardwareError::Status { code: -5, .. })
        ));
        assert_eq!(stage.submitted(), 0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let stage = LoopbackStage::new("stop", LoopbackConfig::default()).unwrap();
        stage.stop();
        stage.stop();
        let err = stage
            .submit(&PortId::input(0), BufferHeader::event(Command::EndOfStream))
            .unwrap_err();
        assert!(matches!(err.error, crate::error::Error::Hardware(HardwareError::WorkerStopped)));
    }
}
