//! In-memory hypervisor for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::DomainDescription;

use super::{
    descriptor_name, BlockStats, CpuStats, DomainHandle, DomainState, Hypervisor,
    HypervisorError, InterfaceStats, MemoryStats,
};

struct FakeDomain {
    id: u32,
    uuid: String,
    state: DomainState,
    descriptor: String,
    ip: Option<String>,
}

/// Records every call as `op:name` and lets tests make any op fail.
#[derive(Default)]
pub struct FakeHypervisor {
    domains: Mutex<HashMap<String, FakeDomain>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    dead: Mutex<bool>,
    next_id: Mutex<u32>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `op` call fail.
    pub fn fail(&self, op: &'static str) {
        lock(&self.failing).insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        lock(&self.failing).remove(op);
    }

    pub fn set_alive(&self, alive: bool) {
        *lock(&self.dead) = !alive;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        lock(&self.calls)
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Calls that change domain state or definitions.
    pub fn mutating_calls(&self) -> usize {
        ["define", "start", "shutdown", "destroy", "reboot", "suspend", "resume", "undefine"]
            .iter()
            .map(|op| self.call_count(op))
            .sum()
    }

    /// Place a domain directly, bypassing define.
    pub fn insert_domain(&self, name: &str, state: DomainState) {
        let id = self.bump_id();
        lock(&self.domains).insert(
            name.to_string(),
            FakeDomain {
                id,
                uuid: format!("00000000-0000-0000-0000-{:012}", id),
                state,
                descriptor: format!("<domain><name>{}</name></domain>", name),
                ip: None,
            },
        );
    }

    pub fn remove_domain(&self, name: &str) {
        lock(&self.domains).remove(name);
    }

    pub fn set_state(&self, name: &str, state: DomainState) {
        if let Some(d) = lock(&self.domains).get_mut(name) {
            d.state = state;
        }
    }

    pub fn set_ip(&self, name: &str, ip: &str) {
        if let Some(d) = lock(&self.domains).get_mut(name) {
            d.ip = Some(ip.to_string());
        }
    }

    pub fn domain_state(&self, name: &str) -> Option<DomainState> {
        lock(&self.domains).get(name).map(|d| d.state)
    }

    pub fn domain_count(&self) -> usize {
        lock(&self.domains).len()
    }

    fn bump_id(&self) -> u32 {
        let mut id = lock(&self.next_id);
        *id += 1;
        *id
    }

    fn enter(&self, op: &'static str, name: &str) -> Result<(), HypervisorError> {
        lock(&self.calls).push(format!("{}:{}", op, name));
        if *lock(&self.dead) || lock(&self.failing).contains(op) {
            return Err(HypervisorError::Call(format!("injected {} failure", op)));
        }
        Ok(())
    }

    /// Apply a state change that requires the domain to be in `from`.
    fn transition(
        &self,
        op: &'static str,
        name: &str,
        from: &[DomainState],
        to: DomainState,
    ) -> Result<(), HypervisorError> {
        self.enter(op, name)?;
        let mut domains = lock(&self.domains);
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(name.to_string()))?;
        if !from.contains(&domain.state) {
            return Err(HypervisorError::Call(format!(
                "cannot {} domain in state {}",
                op, domain.state
            )));
        }
        domain.state = to;
        Ok(())
    }

    fn with_domain<T>(
        &self,
        op: &'static str,
        name: &str,
        f: impl FnOnce(&FakeDomain) -> T,
    ) -> Result<T, HypervisorError> {
        self.enter(op, name)?;
        lock(&self.domains)
            .get(name)
            .map(f)
            .ok_or_else(|| HypervisorError::NotFound(name.to_string()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

const ACTIVE: &[DomainState] = &[
    DomainState::Running,
    DomainState::Blocked,
    DomainState::Paused,
    DomainState::Shutdown,
    DomainState::PmSuspended,
];
const INACTIVE: &[DomainState] = &[DomainState::Shutoff, DomainState::Crashed, DomainState::NoState];

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn is_alive(&self) -> bool {
        !*lock(&self.dead)
    }

    async fn define(&self, descriptor: &str) -> Result<DomainHandle, HypervisorError> {
        let name = descriptor_name(descriptor)?;
        self.enter("define", &name)?;
        if lock(&self.domains).contains_key(&name) {
            return Err(HypervisorError::Call(format!(
                "domain '{}' already exists",
                name
            )));
        }
        let id = self.bump_id();
        let uuid = DomainDescription::parse(descriptor)
            .ok()
            .and_then(|desc| desc.uuid)
            .unwrap_or_else(|| format!("00000000-0000-0000-0000-{:012}", id));
        lock(&self.domains).insert(
            name.clone(),
            FakeDomain {
                id,
                uuid: uuid.clone(),
                state: DomainState::Shutoff,
                descriptor: descriptor.to_string(),
                ip: None,
            },
        );
        Ok(DomainHandle { name, uuid })
    }

    async fn lookup(&self, name: &str) -> Result<Option<DomainHandle>, HypervisorError> {
        self.enter("lookup", name)?;
        Ok(lock(&self.domains).get(name).map(|d| DomainHandle {
            name: name.to_string(),
            uuid: d.uuid.clone(),
        }))
    }

    async fn start(&self, name: &str) -> Result<(), HypervisorError> {
        self.transition("start", name, INACTIVE, DomainState::Running)
    }

    async fn shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        // the guest honours ACPI instantly
        self.transition("shutdown", name, ACTIVE, DomainState::Shutoff)
    }

    async fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.transition("destroy", name, ACTIVE, DomainState::Shutoff)
    }

    async fn reboot(&self, name: &str) -> Result<(), HypervisorError> {
        self.transition("reboot", name, &[DomainState::Running], DomainState::Running)
    }

    async fn suspend(&self, name: &str) -> Result<(), HypervisorError> {
        self.transition("suspend", name, &[DomainState::Running], DomainState::Paused)
    }

    async fn resume(&self, name: &str) -> Result<(), HypervisorError> {
        self.transition("resume", name, &[DomainState::Paused], DomainState::Running)
    }

    async fn undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.enter("undefine", name)?;
        lock(&self.domains)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::NotFound(name.to_string()))
    }

    async fn is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        self.with_domain("is_active", name, |d| d.state.is_active())
    }

    async fn state(&self, name: &str) -> Result<(DomainState, String), HypervisorError> {
        self.with_domain("state", name, |d| (d.state, "fake".to_string()))
    }

    async fn describe(&self, name: &str) -> Result<String, HypervisorError> {
        self.with_domain("describe", name, |d| d.descriptor.clone())
    }

    async fn cpu_stats(&self, name: &str) -> Result<CpuStats, HypervisorError> {
        self.with_domain("cpu_stats", name, |_| CpuStats {
            cpu_time_ns: 5_000_000_000,
        })
    }

    async fn memory_stats(&self, name: &str) -> Result<MemoryStats, HypervisorError> {
        self.with_domain("memory_stats", name, |_| MemoryStats {
            actual_kib: 2_097_152,
            usable_kib: 1_048_576,
        })
    }

    async fn block_stats(&self, name: &str, _device: &str) -> Result<BlockStats, HypervisorError> {
        self.with_domain("block_stats", name, |_| BlockStats {
            read_bytes: 4096,
            write_bytes: 8192,
        })
    }

    async fn interface_stats(
        &self,
        name: &str,
        _device: &str,
    ) -> Result<InterfaceStats, HypervisorError> {
        self.with_domain("interface_stats", name, |_| InterfaceStats {
            rx_bytes: 1500,
            tx_bytes: 900,
        })
    }

    async fn interface_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        self.with_domain("interface_addresses", name, |d| {
            d.ip.iter().cloned().collect()
        })
    }

    async fn list_defined_domain_names(&self) -> Result<Vec<String>, HypervisorError> {
        self.enter("list_defined", "")?;
        let mut names: Vec<String> = lock(&self.domains)
            .iter()
            .filter(|(_, d)| !d.state.is_active())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_active_domain_ids(&self) -> Result<Vec<u32>, HypervisorError> {
        self.enter("list_active", "")?;
        let mut ids: Vec<u32> = lock(&self.domains)
            .values()
            .filter(|d| d.state.is_active())
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn domain_name(&self, id: u32) -> Result<String, HypervisorError> {
        self.enter("domain_name", &id.to_string())?;
        lock(&self.domains)
            .iter()
            .find(|(_, d)| d.id == id)
            .map(|(n, _)| n.clone())
            .ok_or_else(|| HypervisorError::NotFound(id.to_string()))
    }
}
