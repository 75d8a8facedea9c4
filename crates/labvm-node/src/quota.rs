use crate::store::{Quota, VmRecord};

/// Resources asked for by a create request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

/// Check a create request against the owner's quota.
///
/// Every existing VM of the owner counts, whatever its status. A user with
/// no quota configured cannot create VMs.
pub fn check_quota(
    quota: Option<&Quota>,
    existing: &[VmRecord],
    request: ResourceRequest,
) -> Result<(), QuotaError> {
    let quota = quota.ok_or(QuotaError::NotConfigured)?;

    let used_cpu: u64 = existing.iter().map(|vm| u64::from(vm.cpu_cores)).sum();
    if used_cpu + u64::from(request.cpu_cores) > u64::from(quota.cpu_cores) {
        return Err(QuotaError::Cpu {
            used: used_cpu,
            limit: quota.cpu_cores,
        });
    }

    let used_memory: u64 = existing.iter().map(|vm| u64::from(vm.memory_mb)).sum();
    if used_memory + u64::from(request.memory_mb) > u64::from(quota.memory_mb) {
        return Err(QuotaError::Memory {
            used: used_memory,
            limit: quota.memory_mb,
        });
    }

    let used_disk: u64 = existing.iter().map(|vm| u64::from(vm.disk_gb)).sum();
    if used_disk + u64::from(request.disk_gb) > u64::from(quota.disk_gb) {
        return Err(QuotaError::Disk {
            used: used_disk,
            limit: quota.disk_gb,
        });
    }

    if existing.len() as u64 >= u64::from(quota.vm_limit) {
        return Err(QuotaError::VmCount {
            count: existing.len(),
            limit: quota.vm_limit,
        });
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum QuotaError {
    NotConfigured,
    Cpu { used: u64, limit: u32 },
    Memory { used: u64, limit: u32 },
    Disk { used: u64, limit: u32 },
    VmCount { count: usize, limit: u32 },
}

impl std::fmt::Display for QuotaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaError::NotConfigured => write!(f, "no resource quota configured for user"),
            QuotaError::Cpu { used, limit } => write!(
                f,
                "insufficient CPU quota: {} cores in use, limit {} cores",
                used, limit
            ),
            QuotaError::Memory { used, limit } => write!(
                f,
                "insufficient memory quota: {} MB in use, limit {} MB",
                used, limit
            ),
            QuotaError::Disk { used, limit } => write!(
                f,
                "insufficient disk quota: {} GB in use, limit {} GB",
                used, limit
            ),
            QuotaError::VmCount { count, limit } => write!(
                f,
                "VM limit reached: {} VMs, limit {}",
                count, limit
            ),
        }
    }
}

impl std::error::Error for QuotaError {}
