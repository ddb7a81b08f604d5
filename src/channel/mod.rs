//! Outgoing channel capability and its decorators.
//!
//! A [`Channel`] is anything that accepts wire-level performance messages and
//! can be released. Players never talk to an endpoint directly; they hold a
//! chain of channels built at engage time (pooled channel, effect decorators,
//! optional delay) and torn down in reverse by nested `release` calls.

/// Delay a wrapped channel's messages by a fixed amount.
pub mod delay;
/// Reference-counted per-endpoint pools of leasable channel numbers.
pub mod pool;

/// Capability shared by every outgoing message destination.
pub trait Channel: Send {
    fn send(&mut self, status: u8, data1: u8, data2: u8);

    /// Give the channel back. Safe to call more than once.
    fn release(&mut self);
}

/// Allow boxed channels to be used as channels (for dynamic chains).
impl Channel for Box<dyn Channel> {
    fn send(&mut self, status: u8, data1: u8, data2: u8) {
        (**self).send(status, data1, data2)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Accepts and discards every message.
///
/// The safe fallback when no channel number could be allocated: engagement
/// still succeeds and the rest of the performance graph stays consistent.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullChannel;

impl Channel for NullChannel {
    fn send(&mut self, _status: u8, _data1: u8, _data2: u8) {}

    fn release(&mut self) {}
}
