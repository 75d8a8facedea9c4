use async_trait::async_trait;
use tracing::{debug, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::sys;

use super::{
    BlockStats, CpuStats, DomainHandle, DomainState, Hypervisor, HypervisorError,
    InterfaceStats, MemoryStats,
};

/// Hypervisor backend on the libvirt C API.
///
/// Calls are synchronous; the connection is shared by every task.
pub struct LibvirtHypervisor {
    uri: String,
    conn: Connect,
}

impl LibvirtHypervisor {
    pub fn connect(uri: &str) -> Result<Self, HypervisorError> {
        // libvirt prints every error to stderr unless the default handler is removed.
        virt::error::clear_error_callback();
        let conn = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::Call(format!("failed to connect to {}: {}", uri, e)))?;
        info!(uri = %uri, "connected to libvirt");
        Ok(Self {
            uri: uri.to_string(),
            conn,
        })
    }

    fn domain(&self, name: &str) -> Result<Domain, HypervisorError> {
        Domain::lookup_by_name(&self.conn, name).map_err(|e| libvirt_error(name, e))
    }
}

impl Drop for LibvirtHypervisor {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            warn!(uri = %self.uri, error = %e, "failed to close libvirt connection");
        }
    }
}

fn libvirt_error(subject: &str, e: virt::error::Error) -> HypervisorError {
    match e.code() {
        ErrorNumber::NoDomain => HypervisorError::NotFound(subject.to_string()),
        _ => HypervisorError::Call(format!("{}: {}", subject, e)),
    }
}

fn domain_state(state: sys::virDomainState) -> DomainState {
    match state {
        sys::VIR_DOMAIN_RUNNING => DomainState::Running,
        sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
        sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        sys::VIR_DOMAIN_SHUTDOWN => DomainState::Shutdown,
        sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
        sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
        _ => DomainState::NoState,
    }
}

/// Keyword for the reason codes worth surfacing; others read as "unknown".
fn state_reason(state: DomainState, reason: i32) -> &'static str {
    let Ok(reason) = u32::try_from(reason) else {
        return "unknown";
    };
    match (state, reason) {
        (DomainState::Running, sys::VIR_DOMAIN_RUNNING_BOOTED) => "booted",
        (DomainState::Running, sys::VIR_DOMAIN_RUNNING_UNPAUSED) => "unpaused",
        (DomainState::Running, sys::VIR_DOMAIN_RUNNING_RESTORED) => "restored",
        (DomainState::Paused, sys::VIR_DOMAIN_PAUSED_USER) => "user",
        (DomainState::Shutoff, sys::VIR_DOMAIN_SHUTOFF_SHUTDOWN) => "shutdown",
        (DomainState::Shutoff, sys::VIR_DOMAIN_SHUTOFF_DESTROYED) => "destroyed",
        (DomainState::Shutoff, sys::VIR_DOMAIN_SHUTOFF_CRASHED) => "crashed",
        _ => "unknown",
    }
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    async fn is_alive(&self) -> bool {
        self.conn.is_alive().unwrap_or(false)
    }

    async fn define(&self, descriptor: &str) -> Result<DomainHandle, HypervisorError> {
        let name = super::descriptor_name(descriptor)?;
        let dom = Domain::define_xml(&self.conn, descriptor).map_err(|e| libvirt_error(&name, e))?;
        let uuid = dom.get_uuid_string().map_err(|e| libvirt_error(&name, e))?;
        info!(domain = %name, uuid = %uuid, "domain defined");
        Ok(DomainHandle { name, uuid })
    }

    async fn lookup(&self, name: &str) -> Result<Option<DomainHandle>, HypervisorError> {
        let dom = match self.domain(name) {
            Ok(dom) => dom,
            Err(HypervisorError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let uuid = dom.get_uuid_string().map_err(|e| libvirt_error(name, e))?;
        Ok(Some(DomainHandle {
            name: name.to_string(),
            uuid,
        }))
    }

    async fn start(&self, name: &str) -> Result<(), HypervisorError> {
        debug!(domain = %name, "starting domain");
        self.domain(name)?.create().map_err(|e| libvirt_error(name, e))?;
        Ok(())
    }

    async fn shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain(name)?.shutdown().map_err(|e| libvirt_error(name, e))?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain(name)?.destroy().map_err(|e| libvirt_error(name, e))
    }

    async fn reboot(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain(name)?
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(|e| libvirt_error(name, e))
    }

    async fn suspend(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain(name)?.suspend().map_err(|e| libvirt_error(name, e))?;
        Ok(())
    }

    async fn resume(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain(name)?.resume().map_err(|e| libvirt_error(name, e))?;
        Ok(())
    }

    async fn undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.domain(name)?.undefine().map_err(|e| libvirt_error(name, e))
    }

    async fn is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        self.domain(name)?.is_active().map_err(|e| libvirt_error(name, e))
    }

    async fn state(&self, name: &str) -> Result<(DomainState, String), HypervisorError> {
        let (state, reason) = self
            .domain(name)?
            .get_state()
            .map_err(|e| libvirt_error(name, e))?;
        let state = domain_state(state);
        Ok((state, state_reason(state, reason).to_string()))
    }

    async fn describe(&self, name: &str) -> Result<String, HypervisorError> {
        self.domain(name)?
            .get_xml_desc(0)
            .map_err(|e| libvirt_error(name, e))
    }

    async fn cpu_stats(&self, name: &str) -> Result<CpuStats, HypervisorError> {
        let info = self.domain(name)?.get_info().map_err(|e| libvirt_error(name, e))?;
        Ok(CpuStats {
            cpu_time_ns: info.cpu_time,
        })
    }

    async fn memory_stats(&self, name: &str) -> Result<MemoryStats, HypervisorError> {
        let stats = self
            .domain(name)?
            .memory_stats(0)
            .map_err(|e| libvirt_error(name, e))?;
        let mut out = MemoryStats::default();
        for stat in stats {
            match stat.tag {
                sys::VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON => out.actual_kib = stat.val,
                sys::VIR_DOMAIN_MEMORY_STAT_USABLE => out.usable_kib = stat.val,
                _ => {}
            }
        }
        Ok(out)
    }

    async fn block_stats(&self, name: &str, device: &str) -> Result<BlockStats, HypervisorError> {
        let stats = self
            .domain(name)?
            .get_block_stats(device)
            .map_err(|e| libvirt_error(name, e))?;
        Ok(BlockStats {
            read_bytes: non_negative(stats.rd_bytes),
            write_bytes: non_negative(stats.wr_bytes),
        })
    }

    async fn interface_stats(
        &self,
        name: &str,
        device: &str,
    ) -> Result<InterfaceStats, HypervisorError> {
        let stats = self
            .domain(name)?
            .interface_stats(device)
            .map_err(|e| libvirt_error(name, e))?;
        Ok(InterfaceStats {
            rx_bytes: non_negative(stats.rx_bytes),
            tx_bytes: non_negative(stats.tx_bytes),
        })
    }

    async fn interface_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        let ifaces = self
            .domain(name)?
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(|e| libvirt_error(name, e))?;
        Ok(ifaces
            .into_iter()
            .flat_map(|iface| iface.addrs)
            .map(|addr| addr.addr)
            .filter(|addr| addr.parse::<std::net::Ipv4Addr>().is_ok())
            .collect())
    }

    async fn list_defined_domain_names(&self) -> Result<Vec<String>, HypervisorError> {
        self.conn
            .list_defined_domains()
            .map_err(|e| libvirt_error("defined domains", e))
    }

    async fn list_active_domain_ids(&self) -> Result<Vec<u32>, HypervisorError> {
        self.conn
            .list_domains()
            .map_err(|e| libvirt_error("active domains", e))
    }

    async fn domain_name(&self, id: u32) -> Result<String, HypervisorError> {
        let subject = id.to_string();
        Domain::lookup_by_id(&self.conn, id)
            .and_then(|dom| dom.get_name())
            .map_err(|e| libvirt_error(&subject, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libvirt_states_map_onto_domain_states() {
        assert_eq!(domain_state(sys::VIR_DOMAIN_RUNNING), DomainState::Running);
        assert_eq!(domain_state(sys::VIR_DOMAIN_BLOCKED), DomainState::Blocked);
        assert_eq!(domain_state(sys::VIR_DOMAIN_PAUSED), DomainState::Paused);
        assert_eq!(domain_state(sys::VIR_DOMAIN_SHUTDOWN), DomainState::Shutdown);
        assert_eq!(domain_state(sys::VIR_DOMAIN_SHUTOFF), DomainState::Shutoff);
        assert_eq!(domain_state(sys::VIR_DOMAIN_CRASHED), DomainState::Crashed);
        assert_eq!(domain_state(sys::VIR_DOMAIN_PMSUSPENDED), DomainState::PmSuspended);
        assert_eq!(domain_state(sys::VIR_DOMAIN_NOSTATE), DomainState::NoState);
    }

    #[test]
    fn reasons_are_keywords() {
        let booted = sys::VIR_DOMAIN_RUNNING_BOOTED as i32;
        let destroyed = sys::VIR_DOMAIN_SHUTOFF_DESTROYED as i32;
        assert_eq!(state_reason(DomainState::Running, booted), "booted");
        assert_eq!(state_reason(DomainState::Shutoff, destroyed), "destroyed");
        assert_eq!(state_reason(DomainState::Crashed, 0), "unknown");
        assert_eq!(state_reason(DomainState::Running, -1), "unknown");
    }

    #[test]
    fn negative_counters_read_as_zero() {
        assert_eq!(non_negative(-1), 0);
        assert_eq!(non_negative(4096), 4096);
    }
}
