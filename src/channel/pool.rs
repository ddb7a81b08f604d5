//! Per-endpoint pools of leasable channel numbers.
//!
//! One [`ChannelRegistry`] is shared by every player of an organ (or of a
//! whole process, at the caller's choice). It is keyed by endpoint name and
//! reference-counts endpoint use: the physical endpoint opens on the first
//! [`ChannelRegistry::open`] for its name and closes when the last
//! [`PoolHandle`] is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::channel::Channel;
use crate::io::{DeviceError, DeviceProvider, OutputEndpoint};
use crate::ENDPOINT_CHANNELS;

pub struct ChannelRegistry {
    provider: Box<dyn DeviceProvider>,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

struct Pool {
    name: String,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Present while at least one handle is open.
    endpoint: Option<Box<dyn OutputEndpoint>>,
    uses: usize,
    leased: [bool; ENDPOINT_CHANNELS as usize],
}

impl ChannelRegistry {
    pub fn new(provider: Box<dyn DeviceProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Open (or join) the pool for `name`.
    ///
    /// The endpoint is physically opened only on the 0→1 use transition; a
    /// failure there leaves the pool closed so a later open can retry.
    pub fn open(&self, name: &str) -> Result<PoolHandle, DeviceError> {
        let pool = {
            let mut pools = self.pools.lock().unwrap();
            pools
                .entry(name.to_owned())
                .or_insert_with(|| {
                    Arc::new(Pool {
                        name: name.to_owned(),
                        state: Mutex::new(PoolState {
                            endpoint: None,
                            uses: 0,
                            leased: [false; ENDPOINT_CHANNELS as usize],
                        }),
                    })
                })
                .clone()
        };

        let mut state = pool.state.lock().unwrap();
        if state.uses == 0 {
            state.endpoint = Some(self.provider.open(name)?);
            debug!(endpoint = name, "opened output endpoint");
        }
        state.uses += 1;
        drop(state);

        Ok(PoolHandle { pool })
    }
}

/// A reference-counted claim on one endpoint's pool.
///
/// Dropping the handle gives the claim back; the endpoint closes when the
/// last handle for its name goes.
pub struct PoolHandle {
    pool: Arc<Pool>,
}

impl PoolHandle {
    /// Lease the lowest free channel number accepted by `accept`.
    ///
    /// `None` is the allocation failure: either no free number qualifies or
    /// the pool has already been closed.
    pub fn acquire(&self, accept: &dyn Fn(u8) -> bool) -> Option<PooledChannel> {
        let mut state = self.pool.state.lock().unwrap();
        if state.endpoint.is_none() {
            return None;
        }

        for number in 0..ENDPOINT_CHANNELS {
            if !state.leased[number as usize] && accept(number) {
                state.leased[number as usize] = true;
                return Some(PooledChannel {
                    pool: self.pool.clone(),
                    number,
                    released: false,
                });
            }
        }

        debug!(endpoint = %self.pool.name, "no acceptable channel free");
        None
    }

    /// Number of currently leased channels on this endpoint.
    pub fn leased(&self) -> usize {
        let state = self.pool.state.lock().unwrap();
        state.leased.iter().filter(|leased| **leased).count()
    }

    pub fn name(&self) -> &str {
        &self.pool.name
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock().unwrap();
        state.uses -= 1;
        if state.uses == 0 {
            state.endpoint = None;
            debug!(endpoint = %self.pool.name, "closed output endpoint");
        }
    }
}

/// An exclusively leased channel number on one endpoint.
///
/// `send` folds the number into the status low nibble. The lease returns to
/// the pool on `release` (or on drop, as a backstop).
pub struct PooledChannel {
    pool: Arc<Pool>,
    number: u8,
    released: bool,
}

impl PooledChannel {
    pub fn number(&self) -> u8 {
        self.number
    }
}

impl Channel for PooledChannel {
    fn send(&mut self, status: u8, data1: u8, data2: u8) {
        if self.released {
            return;
        }
        let mut state = self.pool.state.lock().unwrap();
        if let Some(endpoint) = state.endpoint.as_mut() {
            endpoint.send(status & 0xF0 | self.number, data1, data2);
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let mut state = self.pool.state.lock().unwrap();
            state.leased[self.number as usize] = false;
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.release();
    }
}
