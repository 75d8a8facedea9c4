use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::hypervisor::{DomainState, Hypervisor, HypervisorError};
use crate::store::{RecordStore, StoreError, VmStatus};

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records whose domain exists and was read back.
    pub synced: u32,
    /// Records with no domain on the hypervisor, now in `error`.
    pub missing: u32,
    /// Records whose domain could not be queried this round.
    pub failed: u32,
}

/// Record status a hypervisor state corresponds to.
pub fn observed_status(state: DomainState) -> VmStatus {
    match state {
        DomainState::Running | DomainState::Blocked => VmStatus::Running,
        DomainState::Paused | DomainState::PmSuspended => VmStatus::Paused,
        DomainState::Shutoff | DomainState::Shutdown => VmStatus::Stopped,
        DomainState::Crashed | DomainState::NoState => VmStatus::Error,
    }
}

/// Overwrites stored status and IP with what the hypervisor reports.
///
/// Last writer wins against lifecycle operations, except that records in
/// `creating` or `deleting` belong to the operation in flight and are skipped.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    hypervisor: Arc<dyn Hypervisor>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { store, hypervisor }
    }

    /// Names of every domain the hypervisor knows, running or not.
    async fn domain_names(&self) -> Result<HashSet<String>, HypervisorError> {
        let mut names: HashSet<String> = self
            .hypervisor
            .list_defined_domain_names()
            .await?
            .into_iter()
            .collect();
        for id in self.hypervisor.list_active_domain_ids().await? {
            match self.hypervisor.domain_name(id).await {
                Ok(name) => {
                    names.insert(name);
                }
                // the domain went away between the two calls
                Err(HypervisorError::NotFound(_)) => debug!(id, "active domain vanished"),
                Err(e) => return Err(e),
            }
        }
        Ok(names)
    }

    pub async fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        let names = self.domain_names().await.map_err(ReconcileError::Hypervisor)?;
        let vms = self.store.list_vms().await.map_err(ReconcileError::Store)?;
        let mut report = SweepReport::default();

        for vm in vms {
            if vm.status.is_transient() {
                continue;
            }

            if !names.contains(&vm.name) {
                if vm.status != VmStatus::Error {
                    warn!(vm_id = %vm.id, name = %vm.name, "domain missing from hypervisor");
                }
                self.store
                    .observe(&vm.id, VmStatus::Error, vm.ip_address.clone())
                    .await
                    .map_err(ReconcileError::Store)?;
                report.missing += 1;
                continue;
            }

            let state = match self.hypervisor.state(&vm.name).await {
                Ok((state, _reason)) => state,
                Err(e) => {
                    warn!(vm_id = %vm.id, error = %e, "failed to query domain state");
                    report.failed += 1;
                    continue;
                }
            };
            let ip_address = if state.is_active() {
                match self.hypervisor.interface_addresses(&vm.name).await {
                    Ok(addrs) => addrs.into_iter().next(),
                    Err(e) => {
                        debug!(vm_id = %vm.id, error = %e, "no interface addresses");
                        None
                    }
                }
            } else {
                None
            };

            match self
                .store
                .observe(&vm.id, observed_status(state), ip_address)
                .await
            {
                Ok(_) => report.synced += 1,
                // deleted while we were looking
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(ReconcileError::Store(e)),
            }
        }

        Ok(report)
    }

    /// Sweep every `period` until the task is dropped.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(report) => info!(
                    synced = report.synced,
                    missing = report.missing,
                    failed = report.failed,
                    "status reconciled"
                ),
                Err(e) => warn!(error = %e, "status reconciliation failed"),
            }
        }
    }
}

#[derive(Debug)]
pub enum ReconcileError {
    Hypervisor(HypervisorError),
    Store(StoreError),
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::Hypervisor(e) => write!(f, "failed to list domains: {}", e),
            ReconcileError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ReconcileError {}
