// Purpose - the device boundary: endpoints the engine is handed, never discovers

pub mod midi;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("output endpoint `{0}` is unavailable")]
    Unavailable(String),

    #[error("MIDI error: {0}")]
    Midi(String),
}

/// An already-open destination for wire-level messages.
pub trait OutputEndpoint: Send {
    fn send(&mut self, status: u8, data1: u8, data2: u8);
}

/// Hands out endpoints by name.
///
/// Device discovery and negotiation live outside the engine; the provider is
/// how the host passes its endpoints in.
pub trait DeviceProvider: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn OutputEndpoint>, DeviceError>;
}

type EndpointFactory = Box<dyn Fn() -> Result<Box<dyn OutputEndpoint>, DeviceError> + Send + Sync>;

/// Provider over pre-registered endpoint factories.
#[derive(Default)]
pub struct StaticProvider {
    factories: Mutex<HashMap<String, EndpointFactory>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn OutputEndpoint>, DeviceError> + Send + Sync + 'static,
    {
        self.factories
            .lock()
            .unwrap()
            .insert(name.to_owned(), Box::new(factory));
    }
}

impl DeviceProvider for StaticProvider {
    fn open(&self, name: &str) -> Result<Box<dyn OutputEndpoint>, DeviceError> {
        let factories = self.factories.lock().unwrap();
        match factories.get(name) {
            Some(factory) => factory(),
            None => Err(DeviceError::Unavailable(name.to_owned())),
        }
    }
}

/// Records every message with its arrival time. For tests and monitoring.
#[derive(Clone, Default)]
pub struct Capture {
    shared: Arc<CaptureShared>,
}

#[derive(Default)]
struct CaptureShared {
    opens: Mutex<usize>,
    messages: Mutex<Vec<(Instant, [u8; 3])>>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh endpoint feeding this capture; counts as one open.
    pub fn endpoint(&self) -> Box<dyn OutputEndpoint> {
        *self.shared.opens.lock().unwrap() += 1;
        Box::new(CaptureEndpoint {
            shared: self.shared.clone(),
        })
    }

    /// How many times an endpoint was handed out.
    pub fn opens(&self) -> usize {
        *self.shared.opens.lock().unwrap()
    }

    pub fn messages(&self) -> Vec<[u8; 3]> {
        self.shared
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bytes)| *bytes)
            .collect()
    }

    pub fn timed_messages(&self) -> Vec<(Instant, [u8; 3])> {
        self.shared.messages.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.shared.messages.lock().unwrap().clear();
    }
}

struct CaptureEndpoint {
    shared: Arc<CaptureShared>,
}

impl OutputEndpoint for CaptureEndpoint {
    fn send(&mut self, status: u8, data1: u8, data2: u8) {
        self.shared
            .messages
            .lock()
            .unwrap()
            .push((Instant::now(), [status, data1, data2]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_serves_registered_names_only() {
        let capture = Capture::new();
        let provider = StaticProvider::new();
        let endpoint_capture = capture.clone();
        provider.register("organ", move || Ok(endpoint_capture.endpoint()));

        assert!(provider.open("organ").is_ok());
        assert!(matches!(
            provider.open("other"),
            Err(DeviceError::Unavailable(name)) if name == "other"
        ));
    }

    #[test]
    fn capture_records_in_order() {
        let capture = Capture::new();
        let mut endpoint = capture.endpoint();

        endpoint.send(0x90, 60, 100);
        endpoint.send(0x80, 60, 0);

        assert_eq!(capture.messages(), vec![[0x90, 60, 100], [0x80, 60, 0]]);
        assert_eq!(capture.opens(), 1);
    }
}
