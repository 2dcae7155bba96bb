//! Per-connection state shared by the protocol handlers.
//!
//! A connection receives and sends concurrently: one receive stays armed
//! while queued output drains through a single in-flight send.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a connection is currently doing with its output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Only the receive is armed.
    Receiving,
    /// A send is in flight as well.
    Sending,
}

/// One-shot teardown claim.
///
/// Any number of threads may race to tear a connection down; exactly one
/// wins.
#[derive(Debug)]
pub struct TeardownGate {
    live: AtomicBool,
}

impl TeardownGate {
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
        }
    }

    /// Returns true for the single caller that moves live → tearing down.
    pub fn claim(&self) -> bool {
        self.live
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl Default for TeardownGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Outgoing data for one socket: at most one send in flight, the rest
/// queued in arrival order.
#[derive(Debug, Default)]
pub struct Outbound {
    queue: VecDeque<Vec<u8>>,
    in_flight: bool,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `data`. Returns it back when the caller should submit it now.
    pub fn push(&mut self, data: Vec<u8>) -> Option<Vec<u8>> {
        if data.is_empty() {
            return None;
        }
        if self.in_flight {
            self.queue.push_back(data);
            None
        } else {
            self.in_flight = true;
            Some(data)
        }
    }

    /// The in-flight send finished. Returns the next buffer to submit.
    pub fn complete(&mut self) -> Option<Vec<u8>> {
        match self.queue.pop_front() {
            Some(next) => Some(next),
            None => {
                self.in_flight = false;
                None
            }
        }
    }

    /// Drop everything; used once the connection is being torn down.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = false;
    }

    pub fn state(&self) -> ConnState {
        if self.in_flight {
            ConnState::Sending
        } else {
            ConnState::Receiving
        }
    }

    /// Buffers waiting behind the in-flight send.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
