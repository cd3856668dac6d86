//! Deletes a network's devices once nothing uses them.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use vxlan_common::{DriverResult, Link, LinkKind};
use vxlan_types::NetworkId;

use crate::context::DriverContext;
use crate::gateway;
use crate::provisioner;

/// Result of one reclamation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Devices deleted and state dropped.
    Removed,
    /// A slave device or a container still references the network.
    InUse,
    /// No devices of this network exist on the host.
    NotProvisioned,
    /// Devices are kept resident by policy.
    Skipped,
}

/// Deletes the network's devices unless a slave device or a running
/// container still references them. Runs under the network lock.
#[instrument(skip(ctx), fields(network = %id))]
pub async fn try_reclaim(ctx: &DriverContext, id: &NetworkId) -> DriverResult<ReclaimOutcome> {
    if ctx.config.allow_empty {
        return Ok(ReclaimOutcome::Skipped);
    }

    let lock = ctx.networks.lock(id).await;
    let links = ctx.links.link_list().await?;
    let plan = provisioner::teardown_plan(ctx, &lock, &links).await;

    let owned = |l: &Link| plan.devices.iter().any(|d| *d == l.name);
    let protected: HashSet<u32> = links
        .iter()
        .filter(|l| owned(*l) && matches!(l.kind, LinkKind::Vxlan | LinkKind::Bridge))
        .map(|l| l.index)
        .collect();
    if protected.is_empty() {
        lock.remove();
        return Ok(ReclaimOutcome::NotProvisioned);
    }

    let attached = links.iter().find(|l| {
        !owned(*l)
            && !gateway::is_gateway_helper(&l.name)
            && protected.iter().any(|idx| l.is_attached_to(*idx))
    });
    if let Some(link) = attached {
        debug!(device = %link.name, "Network still has attached devices");
        return Ok(ReclaimOutcome::InUse);
    }

    let name = match lock.state().map(|s| s.name.clone()).filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => ctx.daemon.inspect_network(id.as_str()).await?.name,
    };
    let containers = ctx.daemon.list_containers().await?;
    if let Some(container) = containers.iter().find(|c| c.references(&name)) {
        debug!(container = %container.id, "Network still referenced by a container");
        return Ok(ReclaimOutcome::InUse);
    }

    provisioner::remove_devices(ctx, &plan).await?;
    lock.remove();
    info!(vxlan = %plan.vxlan, "Reclaimed network devices");
    Ok(ReclaimOutcome::Removed)
}

/// Runs [`try_reclaim`] in the background. Errors are logged.
pub fn spawn_reclaim(ctx: &Arc<DriverContext>, id: NetworkId) {
    if ctx.config.allow_empty {
        return;
    }
    let tasks = ctx.tasks.clone();
    let ctx = Arc::clone(ctx);
    tasks.spawn(async move {
        match try_reclaim(&ctx, &id).await {
            Ok(outcome) => debug!(network = %id, ?outcome, "Reclaim finished"),
            Err(e) => error!(network = %id, error = %e, "Reclaim failed"),
        }
    });
}
