//! End-to-end pipeline runs over loopback stages

use std::sync::Arc;
use std::time::Duration;

use mmal_pipeline::buffer::{BufferFlags, BufferHeader};
use mmal_pipeline::component::{Component, Connection};
use mmal_pipeline::config::DriverConfig;
use mmal_pipeline::error::{Error, HandlerError, HardwareError};
use mmal_pipeline::handler::{CaptureHandler, FrameCollector, MemoryHandler};
use mmal_pipeline::hardware::loopback::SourceConfig;
use mmal_pipeline::hardware::{LoopbackConfig, LoopbackStage};
use mmal_pipeline::pipeline::{Driver, DriverState, Termination};
use mmal_pipeline::port::{CallbackRegistry, Encoding, PortConfig, PortFormat, Resolution};
use parking_lot::Mutex;
use proptest::prelude::*;

fn driver_config() -> DriverConfig {
    DriverConfig {
        wake_interval_ms: 20,
        drain_timeout_ms: Some(5000),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Decoder component with `handler` on both data ports
fn decoder(config: LoopbackConfig, handler: Arc<MemoryHandler>) -> Arc<Component> {
    let stage = LoopbackStage::new("decoder", config).unwrap();
    let component = Arc::new(Component::new(stage, Arc::new(CallbackRegistry::new())));
    component.register_handler(component.input(0).unwrap(), handler.clone());
    component.register_handler(component.output(0).unwrap(), handler);
    component
        .configure_input(0, &PortConfig::new(Encoding::H264).with_buffers(3, 1000))
        .unwrap();
    component
        .configure_output(0, &PortConfig::new(Encoding::I420).with_resolution(32, 16))
        .unwrap();
    component
}

fn camera(frames: Option<usize>) -> Arc<Component> {
    let stage = LoopbackStage::new(
        "camera",
        LoopbackConfig::default()
            .with_buffer_size_min(256)
            .with_source(SourceConfig {
                frames,
                frame_size: 768,
                interval: Duration::from_millis(2),
                keyframe_interval: 4,
            }),
    )
    .unwrap();
    let component = Arc::new(Component::new(stage, Arc::new(CallbackRegistry::new())));
    component
        .configure_output(0, &PortConfig::new(Encoding::I420).with_resolution(32, 16))
        .unwrap();
    component
}

#[test]
fn test_decode_reproduces_input() {
    let input = pattern(10_000);
    let handler = Arc::new(MemoryHandler::source("file", input.clone()));
    let component = decoder(LoopbackConfig::default().with_buffer_size_min(256), handler.clone());

    let mut driver = Driver::new(component.clone(), driver_config());
    let report = driver.run().unwrap();

    assert_eq!(report.termination, Some(Termination::EndOfStream));
    assert_eq!(driver.state(), DriverState::Terminated);
    assert_eq!(handler.output(), input);
    assert_eq!(report.bytes_dispatched, input.len() as u64);
    // 1000-byte inputs split across 768-byte outputs
    assert!(report.buffers_dispatched > report.buffers_submitted);
    assert!(handler.flags_seen().last().unwrap().contains(BufferFlags::END_OF_STREAM));

    assert!(!component.is_enabled());
    assert!(component.input(0).unwrap().pool().is_none());
    assert!(component.output(0).unwrap().pool().is_none());
}

#[test]
fn test_empty_input_ends_cleanly() {
    let handler = Arc::new(MemoryHandler::source("empty", Vec::new()));
    let component = decoder(LoopbackConfig::default().with_buffer_size_min(256), handler.clone());

    let report = Driver::new(component, driver_config()).run().unwrap();
    assert_eq!(report.termination, Some(Termination::EndOfStream));
    assert_eq!(report.buffers_submitted, 1);
    assert!(handler.output().is_empty());
}

#[test]
fn test_format_change_mid_stream() {
    let input = pattern(20_000);
    let handler = Arc::new(MemoryHandler::source("file", input.clone()));
    let new_format = PortFormat::new(Encoding::I420, Resolution::new(64, 32));
    let config = LoopbackConfig::default()
        .with_buffer_size_min(256)
        .with_buffers(4, 2)
        .with_format_change(3, new_format);
    let component = decoder(config, handler.clone());

    let report = Driver::new(component.clone(), driver_config()).run().unwrap();

    assert_eq!(report.format_changes, 1);
    assert_eq!(report.termination, Some(Termination::EndOfStream));
    assert_eq!(handler.output(), input);

    let format = component.output(0).unwrap().format();
    assert_eq!(format.resolution, Resolution::new(64, 32));
    assert_eq!(format.buffer_size, 64 * 32 * 3 / 2);
    assert_eq!(format.buffer_num, 4);
}

#[test]
fn test_cancel_stops_endless_source() {
    let component = camera(None);
    let sink = Arc::new(MemoryHandler::sink("sink"));
    component.register_handler(component.output(0).unwrap(), sink.clone());
    // Handler is picked up again when the port is enabled
    let mut driver = Driver::new(component.clone(), driver_config());
    driver.cancel_token().cancel_after(Duration::from_millis(150));

    let report = driver.run().unwrap();
    assert_eq!(report.termination, Some(Termination::Cancelled));
    assert!(report.buffers_dispatched > 0);
    assert_eq!(sink.buffers_consumed() as u64, report.buffers_dispatched);
    assert!(component.output(0).unwrap().pool().is_none());
}

#[test]
fn test_cancel_before_start() {
    let component = camera(None);
    let mut driver = Driver::new(component.clone(), driver_config());
    driver.cancel_token().cancel();

    let report = driver.run().unwrap();
    assert_eq!(report.termination, Some(Termination::Cancelled));
    assert_eq!(report.buffers_dispatched, 0);
    assert!(!component.output(0).unwrap().is_enabled());
}

#[test]
fn test_connection_hands_frames_downstream() {
    let camera = camera(Some(10));
    let encoder_stage = LoopbackStage::new("encoder", LoopbackConfig::default().with_buffer_size_min(256)).unwrap();
    let encoder = Arc::new(Component::new(encoder_stage, Arc::new(CallbackRegistry::new())));

    let (collector, frames) = FrameCollector::new(16);
    encoder.register_handler(encoder.output(0).unwrap(), Arc::new(collector));
    encoder
        .configure_output(0, &PortConfig::new(Encoding::I420).with_resolution(32, 16))
        .unwrap();

    let connection = Connection::connect(camera.output(0).unwrap(), encoder.input(0).unwrap()).unwrap();
    assert!(encoder.input(0).unwrap().pool().is_none());

    let report = Driver::new(encoder.clone(), driver_config())
        .with_upstream(camera.clone())
        .run()
        .unwrap();

    assert_eq!(report.termination, Some(Termination::EndOfStream));
    assert_eq!(connection.forwarded(), 10);
    assert_eq!(report.buffers_dispatched, 10);

    let received: Vec<_> = frames.try_iter().collect();
    assert_eq!(received.len(), 10);
    assert!(received.iter().all(|frame| frame.data.len() == 768));
    assert!(received[0].keyframe);
    assert!(!received[1].keyframe);

    assert!(camera.output(0).unwrap().pool().is_none());
    connection.disconnect();
    assert!(!encoder.input(0).unwrap().is_connected());
}

#[test]
fn test_submit_failure_tears_down() {
    let handler = Arc::new(MemoryHandler::source("file", pattern(50_000)));
    // Three output buffers go in at start, then the input is refused after two
    let config = LoopbackConfig::default()
        .with_buffer_size_min(256)
        .with_submit_failure(5);
    let component = decoder(config, handler);

    let mut driver = Driver::new(component.clone(), driver_config());
    let err = driver.run().unwrap_err();

    assert!(matches!(err, Error::Hardware(HardwareError::Status { code: -5, .. })));
    assert_eq!(driver.state(), DriverState::Terminated);
    assert!(!component.is_enabled());
    for port in component.inputs().iter().chain(component.outputs()) {
        assert!(!port.is_enabled());
        assert!(port.pool().is_none());
    }
}

/// Sink that notes how many buffers its stage had accepted when EOS arrived
struct EosWatch {
    stage: Arc<LoopbackStage>,
    at_eos: Mutex<Option<usize>>,
}

impl CaptureHandler for EosWatch {
    fn name(&self) -> &str {
        "eos-watch"
    }

    fn consume(&self, buffer: &BufferHeader) -> Result<(), HandlerError> {
        if buffer.is_end_of_stream() {
            *self.at_eos.lock() = Some(self.stage.submitted());
        }
        Ok(())
    }
}

#[test]
fn test_nothing_submitted_after_eos_dispatch() {
    let stage = LoopbackStage::new("decoder", LoopbackConfig::default().with_buffer_size_min(256)).unwrap();
    let component = Arc::new(Component::new(stage.clone(), Arc::new(CallbackRegistry::new())));
    let source = Arc::new(MemoryHandler::source("file", pattern(5000)));
    let watch = Arc::new(EosWatch {
        stage: stage.clone(),
        at_eos: Mutex::new(None),
    });
    component.register_handler(component.input(0).unwrap(), source);
    component.register_handler(component.output(0).unwrap(), watch.clone());
    component
        .configure_input(0, &PortConfig::new(Encoding::H264).with_buffers(3, 1000))
        .unwrap();
    component
        .configure_output(0, &PortConfig::new(Encoding::I420).with_resolution(32, 16))
        .unwrap();

    let report = Driver::new(component, driver_config()).run().unwrap();

    assert_eq!(report.termination, Some(Termination::EndOfStream));
    let at_eos = (*watch.at_eos.lock()).expect("EOS was never dispatched");
    assert_eq!(stage.submitted(), at_eos);
}

#[test]
fn test_refused_hand_off_aborts_run() {
    let camera = camera(Some(10));
    let encoder_stage = LoopbackStage::new(
        "encoder",
        LoopbackConfig::default().with_buffer_size_min(256).with_input_failure(2),
    )
    .unwrap();
    let encoder = Arc::new(Component::new(encoder_stage, Arc::new(CallbackRegistry::new())));
    encoder.register_handler(encoder.output(0).unwrap(), Arc::new(MemoryHandler::sink("sink")));
    encoder
        .configure_output(0, &PortConfig::new(Encoding::I420).with_resolution(32, 16))
        .unwrap();
    let connection = Connection::connect(camera.output(0).unwrap(), encoder.input(0).unwrap()).unwrap();

    let mut driver = Driver::new(encoder.clone(), driver_config()).with_upstream(camera.clone());
    // Turns a stall into a failed assertion instead of a hung test
    driver.cancel_token().cancel_after(Duration::from_secs(5));
    let err = driver.run().unwrap_err();

    assert!(matches!(err, Error::Hardware(HardwareError::Status { code: -5, .. })));
    assert_eq!(driver.state(), DriverState::Terminated);
    assert_eq!(connection.forwarded(), 2);
    for component in [&camera, &encoder] {
        assert!(!component.is_enabled());
        for port in component.outputs() {
            assert!(!port.is_enabled());
            assert!(port.pool().is_none());
        }
    }
    connection.disconnect();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_decode_any_length(len in 0usize..6000, chunk in 1usize..1500) {
        let input = pattern(len);
        let handler = Arc::new(MemoryHandler::source("file", input.clone()).with_chunk_size(chunk));
        let component = decoder(LoopbackConfig::default().with_buffer_size_min(256), handler.clone());

        let report = Driver::new(component, driver_config()).run().unwrap();
        prop_assert_eq!(report.termination, Some(Termination::EndOfStream));
        prop_assert_eq!(handler.output(), input);
    }
}
