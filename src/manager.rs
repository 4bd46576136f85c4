use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::engine::{PresenceEngine, Reconciliation};
use crate::error::{ScanError, StoreError};
use crate::notify::Dispatcher;
use crate::scanner::Scanner;
use crate::store::PresenceStore;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),
    #[error("store failed: {0}")]
    Store(#[from] StoreError),
}

/// Owns the scan, reconcile, notify cycle. Nothing else writes device
/// state while the manager is running.
pub struct Manager<S, P> {
    scanner: S,
    store: P,
    engine: PresenceEngine,
    dispatcher: Option<Dispatcher>,
    interval: Duration,
}

impl<S: Scanner, P: PresenceStore> Manager<S, P> {
    /// Without a dispatcher, cycles only track presence.
    pub fn new(
        scanner: S,
        store: P,
        engine: PresenceEngine,
        dispatcher: Option<Dispatcher>,
        interval: Duration,
    ) -> Self {
        Manager {
            scanner,
            store,
            engine,
            dispatcher,
            interval,
        }
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// Run one cycle. Notifications are skipped when `notify` is false.
    pub async fn run_cycle(&mut self, notify: bool) -> Result<Reconciliation, CycleError> {
        let started = Instant::now();
        let snapshot = self.scanner.scan().await?;
        let cycle = self
            .engine
            .reconcile(&mut self.store, &snapshot, snapshot.taken_at)?;

        if let Some(dispatcher) = self.dispatcher.as_mut().filter(|_| notify) {
            let sent = dispatcher.dispatch(&cycle, Utc::now()).await;
            debug!("Sent {} of {} notification(s)", sent.len(), cycle.transitions.len());
        }

        debug!(
            "Cycle finished in {:?}: {} seen, {} transition(s)",
            started.elapsed(),
            snapshot.observations.len(),
            cycle.transitions.len()
        );
        Ok(cycle)
    }

    /// Run cycles every `interval` (measured between cycle starts) until
    /// cancelled. A cycle still running when the next is due makes that
    /// tick be skipped. The first cycle only primes state.
    pub async fn run_loop(&mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut primed = false;

        info!("Starting presence loop (interval: {:?})", self.interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Cancellation is only observed between cycles.
            match self.run_cycle(primed).await {
                Ok(cycle) => {
                    if !primed {
                        info!("Initial scan done, {} new device(s)", cycle.transitions.len());
                    }
                    primed = true;
                }
                Err(CycleError::Scan(err)) => warn!("Skipping cycle: {}", err),
                Err(CycleError::Store(err)) => error!("Cycle not committed, retrying next tick: {}", err),
            }
        }
        info!("Presence loop stopped");
    }
}
