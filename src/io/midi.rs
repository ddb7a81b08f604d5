//! midir-backed output endpoints.

use midir::{MidiOutput, MidiOutputConnection};
use tracing::warn;

use super::{DeviceError, OutputEndpoint};

/// Wraps an already-connected `midir` output port as an engine endpoint.
///
/// Sends are fire-and-forget: a failing send is logged, never propagated
/// into the performance path.
pub struct MidirEndpoint {
    connection: MidiOutputConnection,
}

impl MidirEndpoint {
    pub fn new(connection: MidiOutputConnection) -> Self {
        Self { connection }
    }
}

impl OutputEndpoint for MidirEndpoint {
    fn send(&mut self, status: u8, data1: u8, data2: u8) {
        if let Err(err) = self.connection.send(&[status, data1, data2]) {
            warn!(%err, "MIDI send failed");
        }
    }
}

/// Names of the currently available MIDI output ports.
pub fn output_ports() -> Result<Vec<String>, DeviceError> {
    let output = MidiOutput::new("pipework").map_err(|err| DeviceError::Midi(err.to_string()))?;

    let mut names = Vec::new();
    for port in output.ports() {
        let name = output
            .port_name(&port)
            .map_err(|err| DeviceError::Midi(err.to_string()))?;
        names.push(name);
    }
    Ok(names)
}

/// Connect to the first output port whose name contains `name`.
pub fn connect(name: &str) -> Result<MidirEndpoint, DeviceError> {
    let output = MidiOutput::new("pipework").map_err(|err| DeviceError::Midi(err.to_string()))?;

    let port = output
        .ports()
        .into_iter()
        .find(|port| {
            output
                .port_name(port)
                .map(|n| n.contains(name))
                .unwrap_or(false)
        })
        .ok_or_else(|| DeviceError::Unavailable(name.to_owned()))?;

    let connection = output
        .connect(&port, "pipework-output")
        .map_err(|err| DeviceError::Midi(err.to_string()))?;
    Ok(MidirEndpoint::new(connection))
}
