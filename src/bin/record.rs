//! Camera Recorder
//!
//! Camera source connected to an encoder; the encoded stream is written to
//! the capture directory for a fixed time.
//!
//! Usage: `record [seconds]`

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mmal_pipeline::{
    component::{Component, Connection},
    config::PipelineConfig,
    hardware::{loopback::frame_bytes, LoopbackConfig, LoopbackStage, SourceConfig},
    handler::StreamCaptureHandler,
    pipeline::Driver,
    port::{CallbackRegistry, Encoding, PortConfig, PortFormat, Resolution},
};

const DEFAULT_SECONDS: u64 = 5;
const CAMERA_WIDTH: u32 = 640;
const CAMERA_HEIGHT: u32 = 480;
const CAMERA_FPS: i32 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let seconds = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u64>().with_context(|| format!("invalid duration {:?}", arg))?,
        None => DEFAULT_SECONDS,
    };

    tracing::info!("Starting camera recorder for {}s", seconds);

    let config = PipelineConfig::load_or_default();
    let camera_format = PortFormat::new(Encoding::I420, Resolution::new(CAMERA_WIDTH, CAMERA_HEIGHT));

    let registry = Arc::new(CallbackRegistry::new());
    let camera_stage = LoopbackStage::new(
        "camera",
        LoopbackConfig::default().with_source(SourceConfig {
            frames: None,
            frame_size: frame_bytes(&camera_format),
            interval: Duration::from_millis(1000 / CAMERA_FPS as u64),
            keyframe_interval: CAMERA_FPS as usize,
        }),
    )?;
    let encoder_stage = LoopbackStage::new("encoder", LoopbackConfig::default().with_buffer_size_min(64 * 1024))?;

    let camera = Arc::new(Component::new(camera_stage, registry.clone()));
    let encoder = Arc::new(Component::new(encoder_stage, registry));

    camera.configure_output(
        0,
        &PortConfig::new(Encoding::I420)
            .with_resolution(CAMERA_WIDTH, CAMERA_HEIGHT)
            .with_framerate(CAMERA_FPS)
            .with_zero_copy(true),
    )?;

    let output_config = match config.output.encoding {
        Some(_) => config.output.clone(),
        None => PortConfig::new(Encoding::H264).with_resolution(CAMERA_WIDTH, CAMERA_HEIGHT),
    };
    let sink = Arc::new(StreamCaptureHandler::new(&config.capture.directory, "h264")?);
    if let Some(port) = encoder.output(0) {
        encoder.register_handler(port, sink.clone());
    }
    encoder.configure_output(0, &output_config)?;

    let (Some(camera_out), Some(encoder_in)) = (camera.output(0), encoder.input(0)) else {
        anyhow::bail!("camera or encoder is missing a port");
    };
    let connection = Connection::connect(camera_out, encoder_in)?;

    let mut driver = Driver::new(encoder, config.driver.clone()).with_upstream(camera);
    let cancel = driver.cancel_token();
    cancel.cancel_after(Duration::from_secs(seconds));

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping recorder");
            interrupt.cancel();
        }
    });

    let report = tokio::task::spawn_blocking(move || driver.run()).await??;
    sink.flush()?;

    println!(
        "Recorded {} buffers ({} bytes, {} frames through {}) in {:.2?}",
        report.buffers_dispatched,
        report.bytes_dispatched,
        connection.forwarded(),
        connection.id(),
        report.elapsed
    );
    if let Some(path) = sink.current_path() {
        println!("Output: {}", path.display());
    }

    connection.disconnect();
    Ok(())
}
