use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    descriptor_name, BlockStats, CpuStats, DomainHandle, DomainState, Hypervisor,
    HypervisorError, InterfaceStats, MemoryStats,
};

/// Hypervisor backend that drives libvirt through the `virsh` CLI.
pub struct VirshHypervisor {
    uri: String,
    /// Domain descriptors are written here before `virsh define` reads them.
    descriptor_dir: String,
}

impl VirshHypervisor {
    pub fn new(uri: &str, data_dir: &str) -> Self {
        Self {
            uri: uri.to_string(),
            descriptor_dir: format!("{}/domains", data_dir),
        }
    }

    /// Run `virsh -c <uri> <args...>` and return its stdout.
    ///
    /// The C locale is forced so state keywords and error text stay in the
    /// English forms the parsers below match on.
    ///
    /// `subject` names the domain (or id) the call is about so that libvirt's
    /// "not found" failures surface as [`HypervisorError::NotFound`].
    async fn virsh(&self, subject: &str, args: &[&str]) -> Result<String, HypervisorError> {
        debug!(uri = %self.uri, args = ?args, "virsh");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| HypervisorError::Call(format!("failed to run virsh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_not_found(&stderr) {
                return Err(HypervisorError::NotFound(subject.to_string()));
            }
            return Err(HypervisorError::Call(format!(
                "virsh {} failed: {}",
                args.first().unwrap_or(&""),
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("virsh");
        cmd.arg("-q")
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .env("LC_ALL", "C")
            .env_remove("LANGUAGE")
            .stdin(Stdio::null());
        cmd
    }

    async fn domstats(&self, name: &str, group: &str) -> Result<HashMap<String, u64>, HypervisorError> {
        let out = self.virsh(name, &["domstats", group, name]).await?;
        Ok(parse_key_values(&out))
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn is_alive(&self) -> bool {
        self.virsh("", &["uri"]).await.is_ok()
    }

    async fn define(&self, descriptor: &str) -> Result<DomainHandle, HypervisorError> {
        let name = descriptor_name(descriptor)?;

        tokio::fs::create_dir_all(&self.descriptor_dir)
            .await
            .map_err(|e| {
                HypervisorError::Call(format!(
                    "failed to create {}: {}",
                    self.descriptor_dir, e
                ))
            })?;
        let path = format!("{}/{}.xml", self.descriptor_dir, name);
        tokio::fs::write(&path, descriptor)
            .await
            .map_err(|e| HypervisorError::Call(format!("failed to write {}: {}", path, e)))?;

        self.virsh(&name, &["define", &path]).await?;
        let uuid = self.virsh(&name, &["domuuid", &name]).await?.trim().to_string();
        info!(domain = %name, uuid = %uuid, "domain defined");
        Ok(DomainHandle { name, uuid })
    }

    async fn lookup(&self, name: &str) -> Result<Option<DomainHandle>, HypervisorError> {
        match self.virsh(name, &["domuuid", name]).await {
            Ok(out) => Ok(Some(DomainHandle {
                name: name.to_string(),
                uuid: out.trim().to_string(),
            })),
            Err(HypervisorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn start(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, &["start", name]).await.map(|_| ())
    }

    async fn shutdown(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, &["shutdown", name]).await.map(|_| ())
    }

    async fn destroy(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, &["destroy", name]).await.map(|_| ())
    }

    async fn reboot(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, &["reboot", name]).await.map(|_| ())
    }

    async fn suspend(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, &["suspend", name]).await.map(|_| ())
    }

    async fn resume(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, &["resume", name]).await.map(|_| ())
    }

    async fn undefine(&self, name: &str) -> Result<(), HypervisorError> {
        self.virsh(name, &["undefine", name]).await?;
        let _ = tokio::fs::remove_file(format!("{}/{}.xml", self.descriptor_dir, name)).await;
        Ok(())
    }

    async fn is_active(&self, name: &str) -> Result<bool, HypervisorError> {
        let (state, _) = self.state(name).await?;
        Ok(state.is_active())
    }

    async fn state(&self, name: &str) -> Result<(DomainState, String), HypervisorError> {
        let out = self.virsh(name, &["domstate", "--reason", name]).await?;
        parse_domstate(&out)
    }

    async fn describe(&self, name: &str) -> Result<String, HypervisorError> {
        self.virsh(name, &["dumpxml", name]).await
    }

    async fn cpu_stats(&self, name: &str) -> Result<CpuStats, HypervisorError> {
        let stats = self.domstats(name, "--cpu-total").await?;
        Ok(CpuStats {
            cpu_time_ns: stats.get("cpu.time").copied().unwrap_or(0),
        })
    }

    async fn memory_stats(&self, name: &str) -> Result<MemoryStats, HypervisorError> {
        let stats = self.domstats(name, "--balloon").await?;
        Ok(MemoryStats {
            actual_kib: stats.get("balloon.current").copied().unwrap_or(0),
            usable_kib: stats.get("balloon.usable").copied().unwrap_or(0),
        })
    }

    async fn block_stats(&self, name: &str, device: &str) -> Result<BlockStats, HypervisorError> {
        let out = self.virsh(name, &["domblkstat", name, device]).await?;
        let stats = parse_device_stats(&out);
        Ok(BlockStats {
            read_bytes: stats.get("rd_bytes").copied().unwrap_or(0),
            write_bytes: stats.get("wr_bytes").copied().unwrap_or(0),
        })
    }

    async fn interface_stats(
        &self,
        name: &str,
        device: &str,
    ) -> Result<InterfaceStats, HypervisorError> {
        let out = self.virsh(name, &["domifstat", name, device]).await?;
        let stats = parse_device_stats(&out);
        Ok(InterfaceStats {
            rx_bytes: stats.get("rx_bytes").copied().unwrap_or(0),
            tx_bytes: stats.get("tx_bytes").copied().unwrap_or(0),
        })
    }

    async fn interface_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        let out = self
            .virsh(name, &["domifaddr", name, "--source", "lease"])
            .await?;
        Ok(parse_domifaddr(&out))
    }

    async fn list_defined_domain_names(&self) -> Result<Vec<String>, HypervisorError> {
        let out = self.virsh("", &["list", "--inactive", "--name"]).await?;
        Ok(non_empty_lines(&out).map(str::to_string).collect())
    }

    async fn list_active_domain_ids(&self) -> Result<Vec<u32>, HypervisorError> {
        let out = self.virsh("", &["list", "--id"]).await?;
        non_empty_lines(&out)
            .map(|line| {
                line.parse::<u32>()
                    .map_err(|_| HypervisorError::Parse(format!("bad domain id: {}", line)))
            })
            .collect()
    }

    async fn domain_name(&self, id: u32) -> Result<String, HypervisorError> {
        let id = id.to_string();
        let out = self.virsh(&id, &["domname", &id]).await?;
        Ok(out.trim().to_string())
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

fn non_empty_lines(out: &str) -> impl Iterator<Item = &str> {
    out.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// `running (booted)` -> (Running, "booted").
fn parse_domstate(out: &str) -> Result<(DomainState, String), HypervisorError> {
    let line = out.trim();
    let (state, reason) = match line.find(" (") {
        Some(i) => (&line[..i], line[i + 2..].trim_end_matches(')')),
        None => (line, ""),
    };
    let state = parse_state_keyword(state)
        .ok_or_else(|| HypervisorError::Parse(format!("unknown domain state: {}", line)))?;
    Ok((state, reason.to_string()))
}

/// State keyword printed by `virsh domstate`.
fn parse_state_keyword(s: &str) -> Option<DomainState> {
    match s.trim() {
        "no state" | "nostate" => Some(DomainState::NoState),
        "running" => Some(DomainState::Running),
        "idle" | "blocked" => Some(DomainState::Blocked),
        "paused" => Some(DomainState::Paused),
        "in shutdown" | "shutdown" => Some(DomainState::Shutdown),
        "shut off" | "shutoff" => Some(DomainState::Shutoff),
        "crashed" => Some(DomainState::Crashed),
        "pmsuspended" => Some(DomainState::PmSuspended),
        _ => None,
    }
}

/// `domstats` prints a `Domain: 'name'` header followed by `key=value` lines.
fn parse_key_values(out: &str) -> HashMap<String, u64> {
    non_empty_lines(out)
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().parse().ok()?))
        })
        .collect()
}

/// `domblkstat`/`domifstat` print `<dev> <key> <value>` lines.
fn parse_device_stats(out: &str) -> HashMap<String, u64> {
    non_empty_lines(out)
        .filter_map(|line| {
            let mut parts = line.split_whitespace().rev();
            let value = parts.next()?.parse().ok()?;
            let key = parts.next()?;
            Some((key.to_string(), value))
        })
        .collect()
}

fn parse_domifaddr(out: &str) -> Vec<String> {
    non_empty_lines(out)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let proto = cols.iter().position(|c| *c == "ipv4")?;
            let addr = cols.get(proto + 1)?;
            Some(addr.split('/').next().unwrap_or(addr).to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_keywords() {
        assert_eq!(parse_state_keyword("running"), Some(DomainState::Running));
        assert_eq!(parse_state_keyword("shut off"), Some(DomainState::Shutoff));
        assert_eq!(parse_state_keyword("in shutdown"), Some(DomainState::Shutdown));
        assert_eq!(parse_state_keyword("idle"), Some(DomainState::Blocked));
        assert_eq!(parse_state_keyword("pmsuspended"), Some(DomainState::PmSuspended));
        assert_eq!(parse_state_keyword("exploded"), None);
    }

    #[test]
    fn domstate_with_reason() {
        let (state, reason) = parse_domstate("running (booted)\n").unwrap();
        assert_eq!(state, DomainState::Running);
        assert_eq!(reason, "booted");

        let (state, reason) = parse_domstate("shut off (destroyed)").unwrap();
        assert_eq!(state, DomainState::Shutoff);
        assert_eq!(reason, "destroyed");
    }

    #[test]
    fn domstate_without_reason() {
        let (state, reason) = parse_domstate("paused").unwrap();
        assert_eq!(state, DomainState::Paused);
        assert!(reason.is_empty());
    }

    #[test]
    fn domstate_unknown_is_parse_error() {
        assert!(matches!(
            parse_domstate("melting"),
            Err(HypervisorError::Parse(_))
        ));
    }

    #[test]
    fn key_values_from_domstats() {
        let out = "Domain: 'lab01'\n  cpu.time=123456789\n  cpu.user=1000\n  balloon.current=2097152\n  state.reason=weird\n";
        let stats = parse_key_values(out);
        assert_eq!(stats.get("cpu.time"), Some(&123456789));
        assert_eq!(stats.get("balloon.current"), Some(&2097152));
        assert!(!stats.contains_key("state.reason"));
    }

    #[test]
    fn device_stats_lines() {
        let out = "vda rd_req 10\nvda rd_bytes 4096\nvda wr_req 2\nvda wr_bytes 8192\n";
        let stats = parse_device_stats(out);
        assert_eq!(stats.get("rd_bytes"), Some(&4096));
        assert_eq!(stats.get("wr_bytes"), Some(&8192));

        let out = "vnet0 rx_bytes 1500\nvnet0 tx_bytes 900\n";
        let stats = parse_device_stats(out);
        assert_eq!(stats.get("rx_bytes"), Some(&1500));
        assert_eq!(stats.get("tx_bytes"), Some(&900));
    }

    #[test]
    fn domifaddr_table() {
        let out = " vnet0      52:54:00:6c:43:6b    ipv4         192.168.122.101/24\n vnet0      52:54:00:6c:43:6b    ipv6         fe80::1/64\n";
        assert_eq!(parse_domifaddr(out), vec!["192.168.122.101".to_string()]);
        assert!(parse_domifaddr("").is_empty());
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(
            "error: failed to get domain 'lab01'\nerror: Domain not found: no domain with matching name 'lab01'"
        ));
        assert!(!is_not_found("error: Requested operation is not valid: domain is not running"));
    }

    #[test]
    fn virsh_runs_in_c_locale() {
        let hv = VirshHypervisor::new("qemu:///system", "/var/lib/labvm");
        let cmd = hv.command(&["domstate", "lab01"]);
        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(envs.contains(&(
            std::ffi::OsStr::new("LC_ALL"),
            Some(std::ffi::OsStr::new("C"))
        )));
        assert!(envs.contains(&(std::ffi::OsStr::new("LANGUAGE"), None)));

        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["-q", "-c", "qemu:///system", "domstate", "lab01"]);
    }

    #[test]
    fn descriptors_live_under_data_dir() {
        let hv = VirshHypervisor::new("qemu:///system", "/var/lib/labvm");
        assert_eq!(hv.descriptor_dir, "/var/lib/labvm/domains");
    }
}
