//! Image File Decoder
//!
//! Feeds an encoded file through a decoder stage and writes the decoded
//! frames into a capture directory.
//!
//! Usage: `decode <input> [output-dir]`

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mmal_pipeline::{
    component::Component,
    config::PipelineConfig,
    handler::StreamCaptureHandler,
    hardware::{LoopbackConfig, LoopbackStage},
    pipeline::{Driver, Termination},
    port::{CallbackRegistry, Encoding, PortConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next().map(PathBuf::from) else {
        bail!("usage: decode <input> [output-dir]");
    };

    tracing::info!("Starting image file decoder");

    let mut config = PipelineConfig::load_or_default();
    if let Some(dir) = args.next() {
        config.capture.directory = PathBuf::from(dir);
    }
    if config.input.encoding.is_none() {
        config.input.encoding = Some(Encoding::H264);
    }
    if config.output.encoding.is_none() {
        config.output = PortConfig::new(Encoding::I420).with_resolution(1920, 1080);
    }

    let handler = Arc::new(
        StreamCaptureHandler::transform(&input, &config.capture.directory, &config.capture.extension)
            .with_context(|| format!("opening {}", input.display()))?,
    );

    let registry = Arc::new(CallbackRegistry::new());
    let stage = LoopbackStage::new("decoder", LoopbackConfig::default())?;
    let decoder = Arc::new(Component::new(stage, registry));

    // Handlers are resolved when ports are configured
    if let (Some(input_port), Some(output_port)) = (decoder.input(0), decoder.output(0)) {
        decoder.register_handler(input_port, handler.clone());
        decoder.register_handler(output_port, handler.clone());
    }
    decoder.configure_input(0, &config.input)?;
    decoder.configure_output(0, &config.output)?;

    let mut driver = Driver::new(decoder, config.driver.clone());
    let cancel = driver.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping decoder");
            cancel.cancel();
        }
    });

    let report = tokio::task::spawn_blocking(move || driver.run()).await??;
    handler.flush()?;

    if report.termination != Some(Termination::EndOfStream) {
        tracing::warn!("Decoder stopped before end of stream");
    }
    if let Some(path) = handler.current_path() {
        println!(
            "Decoded {} buffers ({} bytes) in {:.2?} into {}",
            report.buffers_dispatched,
            report.bytes_dispatched,
            report.elapsed,
            path.display()
        );
    }
    Ok(())
}
