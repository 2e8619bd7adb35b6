//! Per-machine boot progress events.
//!
//! A bounded in-memory ring of state transitions keyed by MAC,
//! consumed by the status endpoint. Observability only; nothing in
//! the boot path reads it back.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use macaddr::MacAddr6;
use serde::Serialize;

use super::machine::mac_string;

/// Where a machine is in its boot conversation with us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineState {
    /// The Booter said this machine should not netboot.
    Ignored,
    ProxyDhcp,
    ProxyDhcpIpxe,
    Pxe,
    Tftp,
    IpxeScript,
    Kernel,
    Initrd,
    Booted,
}

/// One observed state transition.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub mac: String,
    pub state: MachineState,
    pub message: String,
}

/// Bounded ring of events, oldest dropped first.
pub struct EventLog {
    inner: Mutex<VecDeque<Event>>,
    capacity: usize,
}

const DEFAULT_CAPACITY: usize = 1000;

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, mac: &MacAddr6, state: MachineState, message: impl Into<String>) {
        let event = Event {
            timestamp: Utc::now(),
            mac: mac_string(mac),
            state,
            message: message.into(),
        };

        let mut ring = self.inner.lock().expect("event ring poisoned");
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Copy of the current ring contents, oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        let ring = self.inner.lock().expect("event ring poisoned");
        ring.iter().cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
