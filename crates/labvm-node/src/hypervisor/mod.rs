//! Capability contract of the hypervisor client library.
//!
//! The node never talks to the hypervisor directly; everything goes through
//! [`Hypervisor`], so the lifecycle code can be exercised against a fake.

#[cfg(feature = "libvirt")]
mod libvirt;
#[cfg(not(feature = "libvirt"))]
mod virsh;

#[cfg(test)]
pub mod fake;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtHypervisor;
#[cfg(not(feature = "libvirt"))]
pub use virsh::VirshHypervisor;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::DomainDescription;

/// Hypervisor-reported domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Whether the domain has a live process behind it.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            DomainState::Shutoff | DomainState::Crashed | DomainState::NoState
        )
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainState::NoState => write!(f, "nostate"),
            DomainState::Running => write!(f, "running"),
            DomainState::Blocked => write!(f, "blocked"),
            DomainState::Paused => write!(f, "paused"),
            DomainState::Shutdown => write!(f, "shutdown"),
            DomainState::Shutoff => write!(f, "stopped"),
            DomainState::Crashed => write!(f, "crashed"),
            DomainState::PmSuspended => write!(f, "suspended"),
        }
    }
}

/// A defined domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    /// Total guest CPU time in nanoseconds.
    pub cpu_time_ns: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub actual_kib: u64,
    pub usable_kib: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Domain lifecycle and inspection primitives, addressed by domain name.
///
/// Implementations block on the hypervisor for as long as it takes; callers
/// apply no timeout.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Whether the hypervisor connection currently answers.
    async fn is_alive(&self) -> bool;

    async fn define(&self, descriptor: &str) -> Result<DomainHandle, HypervisorError>;
    async fn lookup(&self, name: &str) -> Result<Option<DomainHandle>, HypervisorError>;

    async fn start(&self, name: &str) -> Result<(), HypervisorError>;
    /// Graceful ACPI shutdown.
    async fn shutdown(&self, name: &str) -> Result<(), HypervisorError>;
    /// Immediate power-off.
    async fn destroy(&self, name: &str) -> Result<(), HypervisorError>;
    async fn reboot(&self, name: &str) -> Result<(), HypervisorError>;
    async fn suspend(&self, name: &str) -> Result<(), HypervisorError>;
    async fn resume(&self, name: &str) -> Result<(), HypervisorError>;
    async fn undefine(&self, name: &str) -> Result<(), HypervisorError>;

    async fn is_active(&self, name: &str) -> Result<bool, HypervisorError>;
    /// Current state plus the hypervisor's free-form reason.
    async fn state(&self, name: &str) -> Result<(DomainState, String), HypervisorError>;
    /// Live domain descriptor document.
    async fn describe(&self, name: &str) -> Result<String, HypervisorError>;

    async fn cpu_stats(&self, name: &str) -> Result<CpuStats, HypervisorError>;
    async fn memory_stats(&self, name: &str) -> Result<MemoryStats, HypervisorError>;
    async fn block_stats(&self, name: &str, device: &str) -> Result<BlockStats, HypervisorError>;
    async fn interface_stats(
        &self,
        name: &str,
        device: &str,
    ) -> Result<InterfaceStats, HypervisorError>;
    /// IPv4 addresses leased to the domain's NICs.
    async fn interface_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError>;

    /// Names of defined domains that are not running.
    async fn list_defined_domain_names(&self) -> Result<Vec<String>, HypervisorError>;
    /// Runtime ids of active domains.
    async fn list_active_domain_ids(&self) -> Result<Vec<u32>, HypervisorError>;
    async fn domain_name(&self, id: u32) -> Result<String, HypervisorError>;
}

/// Open the hypervisor client selected at build time.
#[cfg(feature = "libvirt")]
pub fn connect(uri: &str, _data_dir: &str) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
    Ok(Arc::new(LibvirtHypervisor::connect(uri)?))
}

#[cfg(not(feature = "libvirt"))]
pub fn connect(uri: &str, data_dir: &str) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
    Ok(Arc::new(VirshHypervisor::new(uri, data_dir)))
}

/// Extract the `<name>` of a domain descriptor.
pub fn descriptor_name(descriptor: &str) -> Result<String, HypervisorError> {
    DomainDescription::parse(descriptor)
        .map_err(|e| HypervisorError::Parse(e.to_string()))?
        .name
        .ok_or_else(|| HypervisorError::Parse("domain descriptor has no name".to_string()))
}

#[derive(Debug)]
pub enum HypervisorError {
    /// No domain with that name or id.
    NotFound(String),
    /// The hypervisor rejected the call or could not be reached.
    Call(String),
    /// The hypervisor answered with something we could not read.
    Parse(String),
}

impl std::fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorError::NotFound(name) => write!(f, "domain not found: {}", name),
            HypervisorError::Call(msg) => write!(f, "hypervisor call failed: {}", msg),
            HypervisorError::Parse(msg) => write!(f, "unexpected hypervisor output: {}", msg),
        }
    }
}

impl std::error::Error for HypervisorError {}
