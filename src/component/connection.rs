//! Directed edge from one component's output to another's input
//!
//! Buffers cross the edge without copying. A buffer completed on the upstream
//! output is submitted straight to the downstream input, still owned by the
//! upstream pool; when the downstream stage returns it, the input callback
//! releases it home and refills the upstream output.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{PortError, Result};
use crate::port::{Port, PortKind};

/// Live link between an output port and an input port
///
/// Dropping the connection unlinks the ports.
pub struct Connection {
    id: Uuid,
    output: Port,
    input: Port,
    created: DateTime<Utc>,
}

impl Connection {
    /// Link `output` to `input`
    ///
    /// An uncommitted input adopts the output's format. A committed one must
    /// be compatible with it. The input's own pool is released, since it will
    /// carry upstream buffers.
    pub fn connect(output: &Port, input: &Port) -> Result<Self> {
        expect_kind(output, PortKind::Output)?;
        expect_kind(input, PortKind::Input)?;
        for port in [output, input] {
            if port.is_connected() {
                return Err(PortError::AlreadyConnected(port.name().to_string()).into());
            }
            if port.is_enabled() {
                return Err(PortError::FormatWhileEnabled(port.name().to_string()).into());
            }
        }
        if !output.is_committed() {
            return Err(PortError::NotCommitted(output.name().to_string()).into());
        }

        let format = output.format();
        if input.is_committed() {
            if !format.is_compatible_with(&input.format()) {
                return Err(PortError::Incompatible {
                    from: format.to_string(),
                    to: input.format().to_string(),
                }
                .into());
            }
        } else {
            input.commit(format)?;
        }
        input.destroy_pool()?;

        Port::link(output, input);
        tracing::info!("Connected {} -> {}", output.name(), input.name());

        Ok(Self {
            id: Uuid::new_v4(),
            output: output.clone(),
            input: input.clone(),
            created: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn output(&self) -> &Port {
        &self.output
    }

    pub fn input(&self) -> &Port {
        &self.input
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Buffers handed across this edge so far
    pub fn forwarded(&self) -> u64 {
        self.output.forwarded_count()
    }

    /// Unlink the ports
    pub fn disconnect(self) {
        drop(self);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        Port::unlink(&self.output, &self.input);
        tracing::info!(
            "Disconnected {} -> {} after {} buffers",
            self.output.name(),
            self.input.name(),
            self.forwarded()
        );
    }
}

fn expect_kind(port: &Port, kind: PortKind) -> Result<()> {
    if port.kind() == kind {
        Ok(())
    } else {
        Err(PortError::WrongKind {
            port: port.name().to_string(),
            expected: kind.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::error::Error;
    use crate::hardware::{LoopbackConfig, LoopbackStage, SourceConfig};
    use crate::port::{CallbackRegistry, Encoding, PortConfig};
    use std::sync::Arc;

    fn pair() -> (Component, Component) {
        let registry = Arc::new(CallbackRegistry::new());
        let camera = LoopbackStage::new(
            "camera",
            LoopbackConfig::default().with_source(SourceConfig::default()),
        )
        .unwrap();
        let encoder = LoopbackStage::new("encoder", LoopbackConfig::default()).unwrap();
        (
            Component::new(camera, registry.clone()),
            Component::new(encoder, registry),
        )
    }

    #[test]
    fn test_connect_copies_format() {
        let (camera, encoder) = pair();
        camera
            .configure_output(0, &PortConfig::new(Encoding::I420).with_resolution(64, 32))
            .unwrap();
        encoder
            .configure_input(0, &PortConfig::new(Encoding::I420))
            .unwrap();

        let output = camera.output(0).unwrap();
        let input = encoder.input(0).unwrap();
        let connection = Connection::connect(output, input).unwrap();

        assert!(output.is_connected());
        assert!(input.is_connected());
        assert!(input.pool().is_none());
        assert_eq!(connection.forwarded(), 0);

        connection.disconnect();
        assert!(!output.is_connected());
        assert!(!input.is_connected());
    }

    #[test]
    fn test_connect_rejects_incompatible() {
        let (camera, encoder) = pair();
        camera
            .configure_output(0, &PortConfig::new(Encoding::I420).with_resolution(64, 32))
            .unwrap();
        encoder
            .configure_input(0, &PortConfig::new(Encoding::RGB24).with_resolution(64, 32))
            .unwrap();

        let err = Connection::connect(camera.output(0).unwrap(), encoder.input(0).unwrap());
        assert!(matches!(err, Err(Error::Port(PortError::Incompatible { .. }))));
    }

    #[test]
    fn test_connect_checks_direction_and_commit() {
        let (camera, encoder) = pair();
        let output = camera.output(0).unwrap();
        let input = encoder.input(0).unwrap();

        assert!(matches!(
            Connection::connect(input, output),
            Err(Error::Port(PortError::WrongKind { .. }))
        ));
        assert!(matches!(
            Connection::connect(output, input),
            Err(Error::Port(PortError::NotCommitted(_)))
        ));

        output.configure(&PortConfig::new(Encoding::I420).with_resolution(64, 32)).unwrap();
        let _connection = Connection::connect(output, input).unwrap();
        assert_eq!(input.format().encoding, Encoding::I420);
        assert!(matches!(
            Connection::connect(output, input),
            Err(Error::Port(PortError::AlreadyConnected(_)))
        ));
    }
}
