//! Consumer state and health types.
//!
//! # State Transitions
//!
//! ```text
//!             start()
//! Stopped ───────────────→ Starting
//!    ↑                        │
//!    │                        │ (group ensured)
//!    │                        ↓
//!    │                     Running
//!    │                        │
//!    │                  stop()│
//!    │                        ↓
//!    └─────────────────── Stopping
//!       (current batch done,
//!        source closed)
//! ```
//!
//! `stop()` during `Starting` also lands in `Stopping`; the loop then exits
//! before its first poll.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of a [`Consumer`](super::Consumer).
///
/// Stored as a `u8` in an atomic shared with every
/// [`ShutdownHandle`](super::ShutdownHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    /// Not consuming. Initial and final state.
    Stopped = 0,

    /// `start()` called, setting up the consumer group.
    Starting = 1,

    /// Poll loop active.
    Running = 2,

    /// Stop requested. The loop exits after its current batch.
    Stopping = 3,
}

impl ConsumerState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values read as `Stopped`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Starting,
            2 => ConsumerState::Running,
            3 => ConsumerState::Stopping,
            _ => ConsumerState::Stopped,
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerState::Stopped => write!(f, "Stopped"),
            ConsumerState::Starting => write!(f, "Starting"),
            ConsumerState::Running => write!(f, "Running"),
            ConsumerState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Running totals kept by the poll loop.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub received: AtomicU64,
    pub applied: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub committed: AtomicU64,
}

impl StatsCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the consumer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages read from the broker.
    pub received: u64,
    /// Events written to the store (including tombstones for absent rows).
    pub applied: u64,
    /// Redeliveries short-circuited by the ledger.
    pub duplicates: u64,
    /// Envelopes rejected at decode.
    pub rejected: u64,
    /// Decoded events whose apply failed.
    pub failed: u64,
    /// Messages parked on the dead-letter topic.
    pub dead_lettered: u64,
    /// Offsets committed.
    pub committed: u64,
}

/// Health snapshot for orchestration probes.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: ConsumerState,
    /// Target store answered its health probe.
    pub store_healthy: bool,
    /// Running and the store is reachable.
    pub healthy: bool,
    pub stats: ConsumerStats,
}
