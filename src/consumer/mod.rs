// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event consumer.
//!
//! Ties together:
//! - A broker subscription via [`crate::broker::EventSource`]
//! - The idempotent apply path via [`crate::sync::SyncEngine`]
//! - The poll loop in [`poll_loop`] with its failure policy
//!
//! # Lifecycle
//!
//! 1. `start()` ensures the consumer group exists
//! 2. Runs the poll loop on the calling task until stopped
//! 3. Closes the subscription and returns to `Stopped`
//!
//! Stopping goes through a [`ShutdownHandle`]: a clone of the state flag
//! that a signal listener can flip without touching the loop.

mod poll_loop;
mod types;

pub use types::{ConsumerState, ConsumerStats, HealthCheck};

use crate::broker::EventSource;
use crate::config::ConsumerConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::TargetStore;
use crate::sync::SyncEngine;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use types::StatsCounters;

/// Consumes article events from one topic into one target store.
pub struct Consumer<S: EventSource, T: TargetStore> {
    source: S,
    engine: SyncEngine<T>,
    config: ConsumerConfig,
    state: Arc<AtomicU8>,
    stats: Arc<StatsCounters>,
}

impl<S: EventSource, T: TargetStore> Consumer<S, T> {
    /// Create a consumer in the `Stopped` state.
    pub fn new(source: S, store: T, config: ConsumerConfig) -> Self {
        Self {
            source,
            engine: SyncEngine::new(store),
            config,
            state: Arc::new(AtomicU8::new(ConsumerState::Stopped.as_u8())),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running
    }

    pub fn engine(&self) -> &SyncEngine<T> {
        &self.engine
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.snapshot()
    }

    /// A handle that can stop this consumer from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Same as `shutdown_handle().stop()`.
    pub fn stop(&self) -> bool {
        self.shutdown_handle().stop()
    }

    /// Health snapshot. Probes the target store; everything else is cached.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let store_healthy = match self.engine.store().health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %e, "Target store health check failed");
                false
            }
        };

        HealthCheck {
            state,
            store_healthy,
            healthy: state == ConsumerState::Running && store_healthy,
            stats: self.stats.snapshot(),
        }
    }

    /// Consume until stopped.
    ///
    /// Runs on the calling task and returns once the loop has drained its
    /// current batch after a stop request. Only valid from `Stopped`.
    pub async fn start(&self) -> Result<()> {
        if let Err(actual) = self.state.compare_exchange(
            ConsumerState::Stopped.as_u8(),
            ConsumerState::Starting.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(SyncError::InvalidState {
                expected: ConsumerState::Stopped.to_string(),
                actual: ConsumerState::from_u8(actual).to_string(),
            });
        }
        metrics::set_consumer_state("Starting");

        info!(
            topic = %self.source.topic(),
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            "Starting consumer"
        );

        if let Err(e) = self.source.ensure_group().await {
            self.set_state(ConsumerState::Stopped);
            return Err(e);
        }

        let running = self
            .state
            .compare_exchange(
                ConsumerState::Starting.as_u8(),
                ConsumerState::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if running {
            metrics::set_consumer_state("Running");
            info!("Consumer running");
            poll_loop::run_poll_loop(
                &self.source,
                &self.engine,
                &self.config,
                &self.state,
                &self.stats,
            )
            .await;
        } else {
            info!("Stop requested during startup");
        }

        metrics::set_consumer_state("Stopping");
        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close subscription");
        }

        self.set_state(ConsumerState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            applied = stats.applied,
            duplicates = stats.duplicates,
            rejected = stats.rejected,
            failed = stats.failed,
            committed = stats.committed,
            "Consumer stopped"
        );
        Ok(())
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
        metrics::set_consumer_state(&state.to_string());
    }
}

/// Stops a running [`Consumer`] from any task.
///
/// A single atomic compare-and-swap: never blocks, never waits for the
/// loop. Safe to call from a signal listener, any number of times.
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<AtomicU8>,
}

impl ShutdownHandle {
    /// Request a stop. Returns `true` if this call moved the consumer to
    /// `Stopping`, `false` if it was not starting or running.
    pub fn stop(&self) -> bool {
        for from in [ConsumerState::Running, ConsumerState::Starting] {
            if self
                .state
                .compare_exchange(
                    from.as_u8(),
                    ConsumerState::Stopping.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }
}
