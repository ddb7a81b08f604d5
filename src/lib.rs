pub mod channel; // Outgoing channel capability and decorators
pub mod disposition;
pub mod formula;
pub mod io;
pub mod play; // Element runtime players and the organ-level engine

/// Outgoing channel numbers per endpoint (MIDI limit).
pub const ENDPOINT_CHANNELS: u8 = 16;
