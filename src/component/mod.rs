//! Components: one hardware stage and the ports it exposes
//!
//! A component owns exactly one control port plus the input and output
//! ports its stage reports. It coordinates their lifecycle: configure each
//! data port, enable the stage once every port is ready, start and stop the
//! ports in a fixed order, and release their pools.

pub mod connection;

pub use connection::Connection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::TEARDOWN_DRAIN_MS;
use crate::error::{Error, HardwareError, PortError, Result};
use crate::handler::CaptureHandler;
use crate::hardware::HardwareStage;
use crate::port::{CallbackRegistry, Port, PortConfig, PortFormat, PortId};

/// A processing stage and its ports
pub struct Component {
    id: Uuid,
    name: String,
    hardware: Arc<dyn HardwareStage>,
    registry: Arc<CallbackRegistry>,
    control: Port,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    enabled: AtomicBool,
}

impl Component {
    /// Wrap a hardware stage, creating one port per reported input and output
    pub fn new(hardware: Arc<dyn HardwareStage>, registry: Arc<CallbackRegistry>) -> Self {
        let name = hardware.name().to_string();
        let port = |id: PortId| Port::new(&name, id, hardware.clone(), registry.clone());

        let control = port(PortId::CONTROL);
        let inputs = (0..hardware.input_count()).map(|i| port(PortId::input(i))).collect();
        let outputs = (0..hardware.output_count()).map(|i| port(PortId::output(i))).collect();

        tracing::debug!(
            "Created component {} ({} inputs, {} outputs)",
            name,
            hardware.input_count(),
            hardware.output_count()
        );

        Self {
            id: Uuid::new_v4(),
            name,
            hardware,
            registry,
            control,
            inputs,
            outputs,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hardware(&self) -> &Arc<dyn HardwareStage> {
        &self.hardware
    }

    pub fn control(&self) -> &Port {
        &self.control
    }

    pub fn input(&self, index: usize) -> Option<&Port> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&Port> {
        self.outputs.get(index)
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Attach a capture handler to one of this component's ports
    pub fn register_handler(&self, port: &Port, handler: Arc<dyn CaptureHandler>) {
        self.registry.register(port.guid(), handler);
    }

    pub fn configure_input(&self, index: usize, config: &PortConfig) -> Result<PortFormat> {
        self.input(index)
            .ok_or_else(|| self.unknown(PortId::input(index)))?
            .configure(config)
    }

    pub fn configure_output(&self, index: usize, config: &PortConfig) -> Result<PortFormat> {
        self.output(index)
            .ok_or_else(|| self.unknown(PortId::output(index)))?
            .configure(config)
    }

    /// Enable the stage
    ///
    /// Every data port must have a committed format and a pool; an input fed
    /// by a connection uses the upstream pool instead.
    pub fn enable(&self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }
        for port in self.inputs.iter().chain(&self.outputs) {
            if !port.is_committed() {
                return Err(PortError::NotCommitted(port.name().to_string()).into());
            }
            if port.pool().is_none() && !port.is_connected() {
                return Err(PortError::NoPool(port.name().to_string()).into());
            }
        }
        self.hardware.enable()?;
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("Enabled component {}", self.name);
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.hardware.disable()?;
        tracing::info!("Disabled component {}", self.name);
        Ok(())
    }

    /// Enable control, input and output ports, then give each output every
    /// free buffer to write into
    pub fn start_ports(&self) -> Result<()> {
        self.control.enable()?;
        for port in &self.inputs {
            port.enable()?;
        }
        for port in &self.outputs {
            port.enable()?;
        }
        for port in &self.outputs {
            let sent = port.send_all_free()?;
            tracing::debug!("Primed {} with {} buffers", port.name(), sent);
        }
        Ok(())
    }

    /// Disable control, input and output ports in that order, draining each
    ///
    /// Every port is attempted; the first failure is returned.
    pub fn stop_ports(&self, drain_timeout: Option<Duration>) -> Result<()> {
        let mut first_error = None;
        for port in std::iter::once(&self.control)
            .chain(&self.inputs)
            .chain(&self.outputs)
        {
            if let Err(e) = port.disable(drain_timeout) {
                tracing::error!("Failed to disable {}: {}", port.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release every port's pool
    pub fn clean_port_pools(&self) -> Result<()> {
        let mut first_error = None;
        for port in self.inputs.iter().chain(&self.outputs) {
            if let Err(e) = port.destroy_pool() {
                tracing::error!("Failed to release pool of {}: {}", port.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Best-effort shutdown used on the failure path
    ///
    /// Never blocks indefinitely: draining is capped, and errors are logged
    /// rather than returned.
    pub fn teardown(&self) {
        let timeout = Some(Duration::from_millis(TEARDOWN_DRAIN_MS));
        if let Err(e) = self.stop_ports(timeout) {
            tracing::warn!("Teardown of {}: {}", self.name, e);
        }
        if let Err(e) = self.disable() {
            tracing::warn!("Teardown of {}: {}", self.name, e);
        }
        if let Err(e) = self.clean_port_pools() {
            tracing::warn!("Teardown of {}: {}", self.name, e);
        }
        tracing::info!("Tore down component {}", self.name);
    }

    fn unknown(&self, id: PortId) -> Error {
        HardwareError::UnknownPort(format!("{}/{}", self.name, id)).into()
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
