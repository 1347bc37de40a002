//! Cluster host model.
//!
//! A [`Host`] is shared between pools, policies, and in-flight query
//! plans via `Arc`; it lives as long as its longest holder and is never
//! destroyed while referenced.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// One node of the cluster, with its current up/down state.
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    up: AtomicBool,
}

impl Host {
    /// Hosts start down; the first successful connection marks them up.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            up: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Sets the up/down state; returns `true` when the state changed,
    /// so callers notify policies and observers exactly once per
    /// transition.
    pub(crate) fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::AcqRel) != up
    }
}

/// Host state transition, delivered to observability subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}
