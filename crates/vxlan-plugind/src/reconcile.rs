//! A generic list-and-reconcile loop.
//!
//! Each pass lists the desired inventory and the actual one and creates
//! whatever is missing. Passes repeat on a fixed interval until shutdown.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vxlan_common::DriverResult;

#[async_trait]
pub trait Reconcile: Send + Sync {
    type Item: Send + Sync;

    /// Key that identifies an item in both inventories.
    fn key(&self, item: &Self::Item) -> String;

    async fn desired(&self) -> DriverResult<Vec<Self::Item>>;

    async fn actual(&self) -> DriverResult<HashSet<String>>;

    async fn create(&self, item: &Self::Item) -> DriverResult<()>;
}

/// Counters for one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub desired: usize,
    pub created: usize,
    pub failed: usize,
}

/// Runs one pass. Listing failures abort the pass, creation failures are
/// counted and logged.
pub async fn reconcile_once<R: Reconcile>(reconciler: &R) -> DriverResult<ReconcileStats> {
    let desired = reconciler.desired().await?;
    let actual = reconciler.actual().await?;

    let mut stats = ReconcileStats {
        desired: desired.len(),
        ..Default::default()
    };
    for item in &desired {
        let key = reconciler.key(item);
        if actual.contains(&key) {
            continue;
        }
        match reconciler.create(item).await {
            Ok(()) => stats.created += 1,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to reconcile item");
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}

pub struct ReconcileLoop<R> {
    reconciler: R,
    interval: Duration,
    shutdown: CancellationToken,
}

impl<R: Reconcile> ReconcileLoop<R> {
    pub fn new(reconciler: R, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            reconciler,
            interval,
            shutdown,
        }
    }

    /// Runs passes until the shutdown token is cancelled. The first pass
    /// starts immediately.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting reconcile loop"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Reconcile loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match reconcile_once(&self.reconciler).await {
                        Ok(stats) if stats.created > 0 || stats.failed > 0 => {
                            info!(created = stats.created, failed = stats.failed, "Reconcile pass finished");
                        }
                        Ok(stats) => debug!(desired = stats.desired, "Nothing to reconcile"),
                        Err(e) => warn!(error = %e, "Reconcile pass failed"),
                    }
                }
            }
        }
    }
}
